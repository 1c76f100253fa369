/// Offline preview of the compositing step
/// Runs background removal and caption overlay on a local image, no API calls
///
/// Usage: cargo run --release --bin preview_sticker -- input.png "caption" [--output dir] [--threshold 240] [--no-rotate]

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;

use sticker_workflow::core::config::Config;
use sticker_workflow::services::{Compositor, StickerCompositor};
use sticker_workflow::utils::encode_png;

fn main() -> Result<()> {
    // Parse args
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <image.png> <caption> [--output dir] [--threshold 240] [--no-rotate]",
            args[0]
        );
        std::process::exit(1);
    }

    let input_path = &args[1];
    let caption = &args[2];
    let mut output_dir = "output/preview".to_string();
    let mut threshold: Option<u8> = None;
    let mut rotate = true;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    output_dir = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--threshold" | "-t" => {
                if i + 1 < args.len() {
                    threshold = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--no-rotate" => {
                rotate = false;
                i += 1;
            }
            _ => i += 1,
        }
    }

    std::fs::create_dir_all(&output_dir)?;

    // Load image
    println!("Loading: {}", input_path);
    let img = image::open(input_path).context("Failed to load image")?;
    println!("Image size: {}x{}", img.width(), img.height());

    // Same environment (.env included) as the service
    let mut compositor_config = Config::new()
        .map(|c| c.compositor)
        .unwrap_or_default();
    if let Some(threshold) = threshold {
        compositor_config.background_threshold = threshold;
    }
    if !rotate {
        compositor_config.max_rotation_degrees = 0.0;
    }

    println!("Loading fonts from {}...", compositor_config.fonts_dir);
    let compositor = StickerCompositor::new(compositor_config);

    let start = Instant::now();
    let sticker = compositor.composite_caption(&img, caption)?;
    let elapsed = start.elapsed();

    let input_stem = Path::new(input_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let out_path = format!("{}/{}_sticker.png", output_dir, input_stem);
    std::fs::write(&out_path, encode_png(&sticker)?)?;
    println!("Saved sticker: {}", out_path);

    // Stats
    let transparent = sticker.pixels().filter(|p| p[3] == 0).count();
    let total = (sticker.width() * sticker.height()) as usize;
    println!("\nStats:");
    println!("  Canvas: {}x{}", sticker.width(), sticker.height());
    println!("  Transparent pixels: {:.1}%", transparent as f64 / total.max(1) as f64 * 100.0);
    println!("  Compositing time: {:.1}ms", elapsed.as_secs_f64() * 1000.0);

    Ok(())
}
