pub mod config;
pub mod errors;
pub mod styles;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{
    ApiConfig, CompositorConfig, Config, PackagingConfig, PacingConfig, ServerConfig,
};
pub use errors::{
    CompositorError, ConfigError, CredentialProblem, GenerationError, PackagingError, RunError,
};
pub use styles::{StyleCatalog, StyleEntry};
pub use types::{
    CaptionPair, GenerationResult, ImagePayload, ItemStatus, LedgerEntryView, PlanItem,
    RunContext, StatusCounts, Strategy,
};
