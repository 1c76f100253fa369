pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_image,
    downscale_for_upload,
    encode_png,
    prepare_reference_async,
    remove_near_white_background,
    resize_to,
    slice_grid,
};
pub use metrics::{Metrics, MetricsSnapshot};
