// Image compositor: local, network-free sticker finishing

use image::{imageops, DynamicImage, Rgba, RgbaImage};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

use crate::core::config::CompositorConfig;
use crate::core::errors::{CompositorError, CompositorResult};
use crate::core::types::ImagePayload;
use crate::services::rendering::{CaptionRenderer, CaptionStyle};
use crate::utils::image_ops::{decode_image, encode_png, fit_with_padding, remove_near_white_background, rotate_about_center};
use crate::utils::Metrics;

/// Turns a raw generated image into a finished sticker.
///
/// Implementations hold no per-call mutable state and may be called
/// concurrently.
pub trait Compositor: Send + Sync {
    fn composite_caption(&self, image: &DynamicImage, text: &str) -> CompositorResult<RgbaImage>;
}

/// Fit to canvas, drop the white background, then draw the caption.
pub struct StickerCompositor {
    config: CompositorConfig,
    renderer: CaptionRenderer,
}

impl StickerCompositor {
    pub fn new(config: CompositorConfig) -> Self {
        let renderer = CaptionRenderer::from_dir(&config.fonts_dir, config.font_family.clone());
        Self::with_renderer(config, renderer)
    }

    pub fn with_renderer(config: CompositorConfig, renderer: CaptionRenderer) -> Self {
        Self { config, renderer }
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    fn caption_style(&self) -> CaptionStyle {
        CaptionStyle {
            fill: Rgba(self.config.fill_color),
            stroke_width: self.config.stroke_width,
            shadow_offset: self.config.shadow_offset,
            shadow_blur: self.config.shadow_blur,
        }
    }

    fn rotation(&self) -> f32 {
        let max = self.config.max_rotation_degrees.abs();
        if max == 0.0 {
            0.0
        } else {
            rand::thread_rng().gen_range(-max..=max)
        }
    }

    fn draw_caption(&self, canvas: &mut RgbaImage, text: &str) {
        let canvas_size = self.config.canvas_size;
        let max_width = canvas_size.saturating_sub(self.config.text_margin * 2) as f32;
        let font_size = self.renderer.fit_font_size(
            text,
            max_width,
            self.config.max_font_size,
            self.config.min_font_size,
            self.config.font_step,
            self.config.stroke_width,
        );

        let Some(layer) = self.renderer.render_caption(text, font_size, &self.caption_style()) else {
            return;
        };
        let layer = rotate_about_center(&layer, self.rotation());

        let x = (canvas_size as i64 - layer.width() as i64) / 2;
        let y = canvas_size as i64 - self.config.bottom_margin as i64 - layer.height() as i64;
        imageops::overlay(canvas, &layer, x, y.max(0));
    }
}

impl Compositor for StickerCompositor {
    fn composite_caption(&self, image: &DynamicImage, text: &str) -> CompositorResult<RgbaImage> {
        let fitted = fit_with_padding(image, self.config.canvas_size, self.config.padding)?;
        let mut canvas = remove_near_white_background(&fitted, self.config.background_threshold);

        if !text.trim().is_empty() {
            self.draw_caption(&mut canvas, text.trim());
        }
        Ok(canvas)
    }
}

/// Decode a generated image, composite `caption` onto it and encode the
/// result as PNG, off the async runtime.
pub async fn finish_sticker(
    compositor: Arc<dyn Compositor>,
    raw: ImagePayload,
    caption: String,
    metrics: Option<Metrics>,
) -> CompositorResult<ImagePayload> {
    tokio::task::spawn_blocking(move || -> CompositorResult<ImagePayload> {
        let start = Instant::now();
        let image = decode_image(&raw.data)?;
        let sticker = compositor.composite_caption(&image, &caption)?;
        let bytes = encode_png(&sticker)?;
        if let Some(m) = metrics {
            m.record_compositing(start.elapsed());
        }
        Ok(ImagePayload::png(bytes))
    })
    .await
    .map_err(|e| CompositorError::TaskJoinFailed(e.to_string()))?
}

/// Finish one quadrant sliced from a grid sheet. Returns the quadrant itself
/// (as the item's raw image) and the finished sticker.
pub async fn finish_slice(
    compositor: Arc<dyn Compositor>,
    slice: DynamicImage,
    caption: String,
    metrics: Option<Metrics>,
) -> CompositorResult<(ImagePayload, ImagePayload)> {
    tokio::task::spawn_blocking(move || -> CompositorResult<(ImagePayload, ImagePayload)> {
        let start = Instant::now();
        let raw = encode_png(&slice.to_rgba8())?;
        let sticker = compositor.composite_caption(&slice, &caption)?;
        let bytes = encode_png(&sticker)?;
        if let Some(m) = metrics {
            m.record_compositing(start.elapsed());
        }
        Ok((ImagePayload::png(raw), ImagePayload::png(bytes)))
    })
    .await
    .map_err(|e| CompositorError::TaskJoinFailed(e.to_string()))?
}
