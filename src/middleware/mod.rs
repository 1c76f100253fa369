// Middleware for resilient calls to the generation API
//
// Provides the shared retry/backoff policy and cancellation-aware waiting

pub mod retry;

// Re-export commonly used types
pub use retry::{cancellable, pause, Backoff, RetryPolicy};
