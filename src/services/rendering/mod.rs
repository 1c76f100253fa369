use cosmic_text::{fontdb, Attrs, Buffer, Family, FontSystem, Metrics, Shaping, SwashCache, Weight, Wrap};
use image::{imageops, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Visual parameters for a caption
#[derive(Debug, Clone)]
pub struct CaptionStyle {
    pub fill: Rgba<u8>,
    pub stroke_width: i32,
    pub shadow_offset: i32,
    pub shadow_blur: f32,
}

impl CaptionStyle {
    /// Determine optimal stroke color based on fill color
    pub fn stroke_color(&self) -> Rgba<u8> {
        let brightness = self.fill[0] as u32 + self.fill[1] as u32 + self.fill[2] as u32;

        if brightness < 382 {
            Rgba([255, 255, 255, 255]) // White stroke for dark text
        } else {
            Rgba([0, 0, 0, 255]) // Black stroke for light text
        }
    }

    /// Transparent border needed around the glyphs for stroke, shadow and blur
    fn padding(&self) -> u32 {
        (self.stroke_width.max(0) + self.shadow_offset.abs()) as u32 + (self.shadow_blur * 3.0).ceil() as u32 + 2
    }
}

/// Single-channel coverage of shaped text
#[derive(Debug, Clone)]
pub struct GlyphMask {
    pub width: u32,
    pub height: u32,
    alpha: Vec<u8>,
}

impl GlyphMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            alpha: vec![0; (width * height) as usize],
        }
    }

    pub fn get(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.alpha[(y as u32 * self.width + x as u32) as usize]
    }

    pub fn set_max(&mut self, x: i32, y: i32, value: u8) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let index = (y as u32 * self.width + x as u32) as usize;
        self.alpha[index] = self.alpha[index].max(value);
    }

    pub fn is_blank(&self) -> bool {
        self.alpha.iter().all(|&a| a == 0)
    }

    /// Grow coverage by `radius` pixels using the same roughly circular
    /// offset pattern as a multi-pass stroke.
    pub fn dilate(&self, radius: i32) -> GlyphMask {
        if radius <= 0 {
            return self.clone();
        }

        let radius_sq = (radius * radius) as f32;
        let offsets: Vec<(i32, i32)> = (-radius..=radius)
            .flat_map(|dy| (-radius..=radius).map(move |dx| (dx, dy)))
            .filter(|&(dx, dy)| ((dx * dx + dy * dy) as f32) <= radius_sq * 1.2)
            .collect();

        let mut out = GlyphMask::new(self.width, self.height);
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let value = offsets
                    .iter()
                    .map(|&(dx, dy)| self.get(x - dx, y - dy))
                    .max()
                    .unwrap_or(0);
                out.alpha[(y as u32 * self.width + x as u32) as usize] = value;
            }
        }
        out
    }

    /// Paint `color` through this mask onto `layer` at an offset.
    fn paint(&self, layer: &mut RgbaImage, color: Rgba<u8>, dx: i32, dy: i32) {
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let coverage = self.get(x, y);
                if coverage == 0 {
                    continue;
                }
                let (tx, ty) = (x + dx, y + dy);
                if tx < 0 || ty < 0 || tx >= layer.width() as i32 || ty >= layer.height() as i32 {
                    continue;
                }
                let alpha = (coverage as u32 * color[3] as u32 / 255) as u8;
                let dst = layer.get_pixel_mut(tx as u32, ty as u32);
                blend_over(dst, [color[0], color[1], color[2], alpha]);
            }
        }
    }
}

/// Source-over blend of a straight-alpha pixel onto `dst`.
pub fn blend_over(dst: &mut Rgba<u8>, src: [u8; 4]) {
    let sa = src[3] as f32 / 255.0;
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let channel = |s: u8, d: u8| {
        let value = (s as f32 * sa + d as f32 * da * (1.0 - sa)) / out_a;
        value.round().clamp(0.0, 255.0) as u8
    };
    *dst = Rgba([
        channel(src[0], dst[0]),
        channel(src[1], dst[1]),
        channel(src[2], dst[2]),
        (out_a * 255.0).round() as u8,
    ]);
}

/// Caption text renderer using cosmic-text.
///
/// Shaping and rasterization are synchronous; callers run them inside
/// `spawn_blocking`. The font system sits behind a mutex, so concurrent
/// compositing calls serialize only while shaping and drawing glyphs.
pub struct CaptionRenderer {
    font_system: Mutex<FontSystem>,
    swash_cache: Mutex<SwashCache>,
    family: Option<String>,
    has_fonts: bool,
    warned_no_fonts: AtomicBool,
}

impl CaptionRenderer {
    /// Load every font in `fonts_dir`, falling back to system fonts when the
    /// directory has none.
    pub fn from_dir(fonts_dir: impl AsRef<Path>, family: Option<String>) -> Self {
        let fonts_dir = fonts_dir.as_ref();
        let mut db = fontdb::Database::new();
        db.load_fonts_dir(fonts_dir);

        if db.is_empty() {
            warn!(
                "No fonts found in {}, scanning system fonts instead",
                fonts_dir.display()
            );
            db.load_system_fonts();
            if db.is_empty() {
                warn!("No system fonts either, captions will not be drawn");
            }
        } else {
            info!("Loaded {} font faces from {}", db.len(), fonts_dir.display());
        }

        Self::with_database(db, family)
    }

    pub fn with_database(db: fontdb::Database, family: Option<String>) -> Self {
        let has_fonts = !db.is_empty();
        let font_system = FontSystem::new_with_locale_and_db("en-US".to_string(), db);
        Self {
            font_system: Mutex::new(font_system),
            swash_cache: Mutex::new(SwashCache::new()),
            family,
            has_fonts,
            warned_no_fonts: AtomicBool::new(false),
        }
    }

    pub fn has_fonts(&self) -> bool {
        self.has_fonts
    }

    /// Shaping with an empty font database panics inside cosmic-text, so
    /// visible text is only shaped when at least one face is loaded.
    fn can_shape(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        if !self.has_fonts && !self.warned_no_fonts.swap(true, Ordering::Relaxed) {
            warn!("No fonts loaded, skipping caption text");
        }
        self.has_fonts
    }

    fn family(&self) -> Family<'_> {
        match self.family.as_deref() {
            Some(name) if !name.trim().is_empty() => Family::Name(name),
            _ => Family::SansSerif,
        }
    }

    fn shape(&self, font_system: &mut FontSystem, text: &str, font_size: f32) -> Buffer {
        let metrics = Metrics::new(font_size, font_size * 1.3);
        let mut buffer = Buffer::new(font_system, metrics);
        buffer.set_size(font_system, None, None);
        buffer.set_wrap(font_system, Wrap::None);

        let attrs = Attrs::new().family(self.family()).weight(Weight::BOLD);
        buffer.set_text(font_system, text, &attrs, Shaping::Advanced);
        buffer.shape_until_scroll(font_system, false);
        buffer
    }

    /// Visual extent of a single shaped line: (min_x, max_x, height)
    fn extent(buffer: &Buffer) -> Option<(f32, f32, f32)> {
        let mut min_x = f32::MAX;
        let mut max_x = f32::MIN;
        let mut height = 0.0f32;

        for run in buffer.layout_runs() {
            height = height.max(run.line_top + run.line_height);
            for glyph in run.glyphs.iter() {
                min_x = min_x.min(glyph.x);
                max_x = max_x.max(glyph.x + glyph.w);
            }
        }

        (min_x < max_x).then_some((min_x, max_x, height))
    }

    /// Width and height of `text` at `font_size` in pixels (glyph bounds)
    pub fn measure(&self, text: &str, font_size: f32) -> (f32, f32) {
        if !self.can_shape(text) {
            return (0.0, 0.0);
        }
        let mut font_system = self.font_system.lock();
        let buffer = self.shape(&mut font_system, text, font_size);
        Self::extent(&buffer)
            .map(|(min_x, max_x, height)| (max_x - min_x, height))
            .unwrap_or((0.0, 0.0))
    }

    /// Largest size from `max` down to `min` in `step` decrements whose
    /// stroked width fits `max_width`. Returns `min` if nothing fits.
    pub fn fit_font_size(&self, text: &str, max_width: f32, max: f32, min: f32, step: f32, stroke_width: i32) -> f32 {
        let step = if step > 0.0 { step } else { 1.0 };
        let mut size = max.max(min);
        if !self.can_shape(text) {
            return size;
        }
        loop {
            let (width, _) = self.measure(text, size);
            if width + (stroke_width.max(0) * 2) as f32 <= max_width || size <= min {
                debug!("Caption '{}' fits at {}px ({}px wide)", text, size, width);
                return size;
            }
            size = (size - step).max(min);
        }
    }

    /// Rasterize `text` into a coverage mask with `padding` transparent
    /// pixels on every side. `None` when nothing visible was shaped.
    pub fn rasterize(&self, text: &str, font_size: f32, padding: u32) -> Option<GlyphMask> {
        if !self.can_shape(text) {
            return None;
        }

        let mut font_system = self.font_system.lock();
        let buffer = self.shape(&mut font_system, text, font_size);
        let (min_x, max_x, height) = Self::extent(&buffer)?;

        let width = (max_x - min_x).ceil() as u32 + padding * 2;
        let height = height.ceil() as u32 + padding * 2;
        let origin_x = padding as i32 - min_x.floor() as i32;
        let origin_y = padding as i32;

        let mut mask = GlyphMask::new(width, height);
        let mut swash_cache = self.swash_cache.lock();
        buffer.draw(
            &mut font_system,
            &mut swash_cache,
            cosmic_text::Color::rgba(255, 255, 255, 255),
            |px, py, w, h, color| {
                for dy in 0..h as i32 {
                    for dx in 0..w as i32 {
                        mask.set_max(origin_x + px + dx, origin_y + py + dy, color.a());
                    }
                }
            },
        );

        (!mask.is_blank()).then_some(mask)
    }

    /// Render a caption layer: blurred drop shadow, thick contrasting
    /// outline, solid fill. Transparent everywhere else.
    pub fn render_caption(&self, text: &str, font_size: f32, style: &CaptionStyle) -> Option<RgbaImage> {
        let mask = self.rasterize(text, font_size, style.padding())?;
        let outline = mask.dilate(style.stroke_width);

        let mut shadow = RgbaImage::new(mask.width, mask.height);
        outline.paint(
            &mut shadow,
            Rgba([0, 0, 0, 110]),
            style.shadow_offset,
            style.shadow_offset,
        );
        let mut layer = if style.shadow_blur > 0.0 {
            imageops::blur(&shadow, style.shadow_blur)
        } else {
            shadow
        };

        outline.paint(&mut layer, style.stroke_color(), 0, 0);
        mask.paint(&mut layer, style.fill, 0, 0);
        Some(layer)
    }
}
