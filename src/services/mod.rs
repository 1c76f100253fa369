pub mod compositor;
pub mod generation;
pub mod packaging;
pub mod rendering;

// Re-export commonly used services
pub use compositor::{finish_slice, finish_sticker, Compositor, StickerCompositor};
pub use generation::{
    GeminiClient, GenerationClient, ImageBackend, ImageRequest, PlanSource, StickerGenerator,
};
pub use packaging::{build_package, ArchiveReceipt, Archiver, DirectoryArchiver, StickerPackage};
pub use rendering::CaptionRenderer;
