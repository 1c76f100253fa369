// Library exports for the sticker generation workflow

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{CompositorError, ConfigError, GenerationError, PackagingError, RunError},
    styles::StyleCatalog,
    types::{
        GenerationResult, ImagePayload, ItemStatus, LedgerEntryView, PlanItem, RunContext,
        StatusCounts, Strategy,
    },
};

pub use middleware::{Backoff, RetryPolicy};

pub use orchestration::{
    BatchScheduler, LedgerView, ResultLedger, RunPhase, RunRequest, StickerOrchestrator,
};

pub use services::{
    Compositor, DirectoryArchiver, GeminiClient, GenerationClient, StickerCompositor,
    StickerGenerator,
};

pub use utils::Metrics;
