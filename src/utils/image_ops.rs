use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbImage, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;

use crate::core::errors::{CompositorError, CompositorResult};
use crate::core::types::ImagePayload;

/// Make every pixel whose R, G and B all exceed `threshold` fully transparent.
///
/// The boundary is exclusive: a channel equal to `threshold` keeps the pixel.
/// No edge smoothing is applied.
pub fn remove_near_white_background(image: &RgbaImage, threshold: u8) -> RgbaImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        if r > threshold && g > threshold && b > threshold {
            pixel.0[3] = 0;
        }
    }
    out
}

/// Split a 2x2 sheet into quadrants and return the first `n` in reading order.
///
/// `n` above 4 is clamped. Odd trailing rows/columns are dropped.
pub fn slice_grid(image: &DynamicImage, n: usize) -> Vec<DynamicImage> {
    let half_w = image.width() / 2;
    let half_h = image.height() / 2;
    let origins = [(0, 0), (half_w, 0), (0, half_h), (half_w, half_h)];

    origins
        .iter()
        .take(n.min(4))
        .map(|&(x, y)| image.crop_imm(x, y, half_w, half_h))
        .collect()
}

/// Exact resize with Lanczos3. Aspect ratio is the caller's concern.
pub fn resize_to(image: &DynamicImage, width: u32, height: u32) -> CompositorResult<DynamicImage> {
    if width == 0 || height == 0 {
        return Err(CompositorError::InvalidDimensions { width, height });
    }
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

/// Scale `image` to fit a `canvas` x `canvas` white square with `padding` on
/// every side, centered.
pub fn fit_with_padding(image: &DynamicImage, canvas: u32, padding: u32) -> CompositorResult<RgbaImage> {
    let inner = canvas.saturating_sub(padding * 2);
    if inner == 0 || image.width() == 0 || image.height() == 0 {
        return Err(CompositorError::InvalidDimensions {
            width: image.width(),
            height: image.height(),
        });
    }

    let fitted = image.resize(inner, inner, FilterType::Lanczos3).to_rgba8();
    let mut out = RgbaImage::from_pixel(canvas, canvas, Rgba([255, 255, 255, 255]));
    let x = (canvas - fitted.width()) / 2;
    let y = (canvas - fitted.height()) / 2;
    imageops::overlay(&mut out, &fitted, x as i64, y as i64);
    Ok(out)
}

/// Alpha-flatten onto white (JPEG has no alpha channel).
pub fn flatten_onto_white(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Cap the longer side at `max_dimension` and re-encode as JPEG.
///
/// Images already within bounds are only re-encoded.
pub fn downscale_for_upload(image: &DynamicImage, max_dimension: u32, quality: u8) -> CompositorResult<ImagePayload> {
    if max_dimension == 0 {
        return Err(CompositorError::InvalidDimensions {
            width: max_dimension,
            height: max_dimension,
        });
    }

    let scaled = if image.width() > max_dimension || image.height() > max_dimension {
        image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        image.clone()
    };

    let rgb = flatten_onto_white(&scaled.to_rgba8());
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(rgb).write_with_encoder(encoder)?;
    Ok(ImagePayload::jpeg(bytes))
}

/// Rotate about the center with bilinear sampling, growing the canvas so no
/// corner is clipped. Uncovered area is transparent.
pub fn rotate_about_center(image: &RgbaImage, degrees: f32) -> RgbaImage {
    if degrees.abs() < f32::EPSILON {
        return image.clone();
    }

    let (w, h) = (image.width() as f32, image.height() as f32);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let out_w = (w * cos.abs() + h * sin.abs()).ceil() as u32;
    let out_h = (w * sin.abs() + h * cos.abs()).ceil() as u32;
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ocx, ocy) = (out_w as f32 / 2.0, out_h as f32 / 2.0);

    RgbaImage::from_fn(out_w, out_h, |x, y| {
        let dx = x as f32 + 0.5 - ocx;
        let dy = y as f32 + 0.5 - ocy;
        // inverse rotation back into source space
        let sx = dx * cos + dy * sin + cx - 0.5;
        let sy = -dx * sin + dy * cos + cy - 0.5;
        sample_bilinear(image, sx, sy)
    })
}

fn sample_bilinear(image: &RgbaImage, x: f32, y: f32) -> Rgba<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let fetch = |px: i64, py: i64| -> [f32; 4] {
        if px < 0 || py < 0 || px >= w || py >= h {
            [0.0; 4]
        } else {
            let p = image.get_pixel(px as u32, py as u32).0;
            // premultiply so transparent neighbours do not darken edges
            let a = p[3] as f32 / 255.0;
            [p[0] as f32 * a, p[1] as f32 * a, p[2] as f32 * a, p[3] as f32]
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 4];
    for c in 0..4 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }

    let alpha = out[3];
    if alpha <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let unpremultiply = |c: f32| (c * 255.0 / alpha).round().clamp(0.0, 255.0) as u8;
    Rgba([
        unpremultiply(out[0]),
        unpremultiply(out[1]),
        unpremultiply(out[2]),
        alpha.round().clamp(0.0, 255.0) as u8,
    ])
}

pub fn decode_image(bytes: &[u8]) -> CompositorResult<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

pub fn encode_png(image: &RgbaImage) -> CompositorResult<Vec<u8>> {
    let mut png_bytes = Vec::new();
    let mut cursor = Cursor::new(&mut png_bytes);
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Decode, downscale and re-encode an uploaded reference image off the runtime.
pub async fn prepare_reference_async(
    bytes: Arc<Vec<u8>>,
    max_dimension: u32,
    quality: u8,
) -> CompositorResult<ImagePayload> {
    tokio::task::spawn_blocking(move || {
        let image = decode_image(&bytes)?;
        downscale_for_upload(&image, max_dimension, quality)
    })
    .await
    .map_err(|e| CompositorError::TaskJoinFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255]))
    }

    #[test]
    fn test_background_removal_boundary() {
        let mut image = RgbaImage::new(3, 1);
        image.put_pixel(0, 0, Rgba([241, 241, 241, 255]));
        image.put_pixel(1, 0, Rgba([240, 240, 240, 255]));
        image.put_pixel(2, 0, Rgba([239, 239, 239, 255]));

        let out = remove_near_white_background(&image, 240);
        assert_eq!(out.get_pixel(0, 0).0[3], 0);
        assert_eq!(out.get_pixel(1, 0).0[3], 255);
        assert_eq!(out.get_pixel(2, 0).0[3], 255);
    }

    #[test]
    fn test_background_removal_needs_all_channels() {
        let image = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 200, 255]));
        let out = remove_near_white_background(&image, 240);
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 200, 255]);
    }

    fn quadrant_sheet() -> DynamicImage {
        let colors = [
            Rgba([255, 0, 0, 255]),
            Rgba([0, 255, 0, 255]),
            Rgba([0, 0, 255, 255]),
            Rgba([255, 255, 0, 255]),
        ];
        let image = RgbaImage::from_fn(8, 8, |x, y| {
            let index = (y / 4) * 2 + (x / 4);
            colors[index as usize]
        });
        DynamicImage::ImageRgba8(image)
    }

    #[test]
    fn test_slice_grid_reading_order() {
        let parts = slice_grid(&quadrant_sheet(), 4);
        assert_eq!(parts.len(), 4);

        let firsts: Vec<[u8; 4]> = parts.iter().map(|p| p.to_rgba8().get_pixel(0, 0).0).collect();
        assert_eq!(
            firsts,
            vec![[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255], [255, 255, 0, 255]]
        );
        assert!(parts.iter().all(|p| p.width() == 4 && p.height() == 4));
    }

    #[test]
    fn test_slice_grid_fewer_than_four() {
        let parts = slice_grid(&quadrant_sheet(), 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].to_rgba8().get_pixel(3, 3).0, [0, 255, 0, 255]);

        assert_eq!(slice_grid(&quadrant_sheet(), 0).len(), 0);
        assert_eq!(slice_grid(&quadrant_sheet(), 9).len(), 4);
    }

    #[test]
    fn test_resize_to_exact_dimensions() {
        let image = DynamicImage::ImageRgba8(solid(320, 320, 10));
        let tab = resize_to(&image, 96, 74).unwrap();
        assert_eq!((tab.width(), tab.height()), (96, 74));
        assert!(matches!(
            resize_to(&image, 0, 10),
            Err(CompositorError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_fit_with_padding_centers_content() {
        let image = DynamicImage::ImageRgba8(solid(100, 50, 0));
        let out = fit_with_padding(&image, 320, 20).unwrap();
        assert_eq!((out.width(), out.height()), (320, 320));
        // 280x140 content centered vertically
        let center = out.get_pixel(160, 160).0;
        assert!(center[0] < 8 && center[3] > 250);
        assert_eq!(out.get_pixel(160, 30).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(10, 160).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_downscale_caps_longer_side() {
        let image = DynamicImage::ImageRgba8(solid(1600, 1200, 90));
        let payload = downscale_for_upload(&image, 800, 85).unwrap();
        assert_eq!(payload.mime_type, "image/jpeg");

        let decoded = decode_image(&payload.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 600));
    }

    #[test]
    fn test_downscale_keeps_small_images() {
        let image = DynamicImage::ImageRgba8(solid(200, 100, 90));
        let payload = downscale_for_upload(&image, 800, 85).unwrap();
        let decoded = decode_image(&payload.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
    }

    #[test]
    fn test_rotation_grows_canvas() {
        let image = solid(100, 20, 0);
        assert_eq!(rotate_about_center(&image, 0.0).dimensions(), (100, 20));

        let rotated = rotate_about_center(&image, 4.0);
        assert!(rotated.width() >= 100);
        assert!(rotated.height() > 20);
        // corners outside the source stay transparent
        assert_eq!(rotated.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn test_png_round_trip_keeps_alpha() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 0]));
        let bytes = encode_png(&image).unwrap();
        let decoded = decode_image(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(1, 1).0, [10, 20, 30, 0]);
    }

    #[tokio::test]
    async fn test_prepare_reference_async() {
        let png = encode_png(&solid(1000, 500, 200)).unwrap();
        let payload = prepare_reference_async(Arc::new(png), 800, 85).await.unwrap();
        let decoded = decode_image(&payload.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 400));
    }
}
