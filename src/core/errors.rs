// Error types for every layer of the sticker workflow
//
// Using thiserror so each layer can be matched on precisely:
// - GenerationError is the taxonomy shared by the client and the scheduler
// - CompositorError / PackagingError stay local to pixel work and bundling
// - RunError is what operator actions report back to callers

use thiserror::Error;

/// Substrings in an upstream error message that indicate a transient,
/// quota-style failure worth retrying.
const RETRYABLE_SIGNALS: &[&str] = &[
    "429",
    "quota",
    "rate limit",
    "resource_exhausted",
    "resource exhausted",
    "503",
    "overload",
    "unavailable",
];

/// Why the configured credential cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialProblem {
    /// No key configured at all
    NotConfigured,
    /// The value looks like a cloud project identifier, not an API key
    LooksLikeProjectId,
    /// The value does not have the shape of an API key
    Malformed,
    /// The endpoint refused the key
    Rejected(String),
}

impl std::fmt::Display for CredentialProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no API key configured (set GEMINI_API_KEY)"),
            Self::LooksLikeProjectId => write!(
                f,
                "GEMINI_API_KEY looks like a project id; an API key is expected (usually starts with 'AIza')"
            ),
            Self::Malformed => write!(f, "GEMINI_API_KEY does not look like an API key"),
            Self::Rejected(detail) => write!(f, "API key rejected by the endpoint: {}", detail),
        }
    }
}

/// Failures of the generation client, also used by the scheduler to decide
/// between retrying, recording an item error, or stopping the run.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Blocked by safety filter ({reason})")]
    SafetyBlocked { reason: String },

    #[error("Response contained no image")]
    NoImageReturned,

    #[error("Invalid credential: {0}")]
    InvalidCredential(CredentialProblem),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Plan response could not be parsed: {0}")]
    PlanParseError(String),

    #[error("Compositing failed: {0}")]
    CompositingFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Generation failed: {0}")]
    TransientOrUnknown(String),
}

impl GenerationError {
    /// Whether waiting and trying again can reasonably succeed.
    ///
    /// Unknown failures are only retried when their message carries one of
    /// the known quota/overload signals.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded(_) => true,
            Self::TransientOrUnknown(message) => {
                let lower = message.to_lowercase();
                RETRYABLE_SIGNALS.iter().any(|s| lower.contains(s))
            }
            _ => false,
        }
    }

    /// Failures that make every further request pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredential(_))
    }

    pub fn is_quota(&self) -> bool {
        match self {
            Self::QuotaExceeded(_) => true,
            Self::TransientOrUnknown(_) => self.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Human-readable message naming the probable cause, attached to failed
    /// ledger entries.
    pub fn user_message(&self) -> String {
        match self {
            Self::QuotaExceeded(_) => {
                "Rate limit reached; wait a minute and regenerate this sticker".to_string()
            }
            Self::SafetyBlocked { reason } => {
                format!("Blocked by the content safety filter ({}); try a different caption", reason)
            }
            Self::NoImageReturned => "The model returned no image; try regenerating".to_string(),
            Self::InvalidCredential(problem) => format!("Configuration problem: {}", problem),
            Self::MalformedRequest(detail) => format!("Request rejected: {}", detail),
            Self::PlanParseError(detail) => format!("Planning failed: {}", detail),
            Self::CompositingFailed(detail) => format!("Image processing failed: {}", detail),
            Self::Cancelled => "Cancelled".to_string(),
            Self::TransientOrUnknown(detail) if self.is_retryable() => {
                format!("Service busy or rate limited: {}", detail)
            }
            Self::TransientOrUnknown(detail) => format!("Generation failed: {}", detail),
        }
    }
}

/// Local image processing errors
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("Image processing failed: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Blocking task failed: {0}")]
    TaskJoinFailed(String),
}

/// Packaging errors
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("Ledger still has {0} unfinished items")]
    NotTerminal(usize),

    #[error("No successful stickers to package")]
    NothingToPackage,

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] CompositorError),
}

/// Errors surfaced by operator actions on the orchestrator
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {0} is still in progress")]
    AlreadyRunning(u64),

    #[error("Plan has no captions")]
    EmptyPlan,

    #[error("Unknown style: {0}")]
    UnknownStyle(String),

    #[error("No ledger entry with id {0}")]
    UnknownItem(usize),

    #[error("Planning failed: {0}")]
    Planning(#[source] GenerationError),

    #[error("Run aborted: {0}")]
    Fatal(#[source] GenerationError),

    #[error("Reference image rejected: {0}")]
    Reference(#[from] CompositorError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No image models configured (set IMAGE_MODELS)")]
    NoImageModels,

    #[error("Grid batch size must be between 1 and 4, got {0}")]
    InvalidGridBatchSize(usize),

    #[error("Batch size must be > 0, got {0}")]
    InvalidBatchSize(usize),

    #[error("Attempt count must be > 0 for {0}")]
    InvalidAttempts(&'static str),

    #[error("Invalid compositor config: {0}")]
    InvalidCompositorConfig(String),

    #[error("Unknown generation strategy: {0}")]
    UnknownStrategy(String),

    #[error("Failed to load styles from {path}: {reason}")]
    StylesFile { path: String, reason: String },
}

pub type CompositorResult<T> = Result<T, CompositorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::QuotaExceeded("429".into()).is_retryable());
        assert!(GenerationError::TransientOrUnknown("503 model is overloaded".into()).is_retryable());
        assert!(GenerationError::TransientOrUnknown("RESOURCE_EXHAUSTED".into()).is_retryable());
        assert!(!GenerationError::TransientOrUnknown("connection reset".into()).is_retryable());
        assert!(!GenerationError::SafetyBlocked { reason: "SAFETY".into() }.is_retryable());
        assert!(!GenerationError::NoImageReturned.is_retryable());
        assert!(!GenerationError::Cancelled.is_retryable());
    }

    #[test]
    fn test_credential_errors_are_fatal() {
        let err = GenerationError::InvalidCredential(CredentialProblem::NotConfigured);
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.user_message().contains("GEMINI_API_KEY"));
        assert!(!GenerationError::QuotaExceeded(String::new()).is_fatal());
    }

    #[test]
    fn test_user_message_names_cause() {
        let quota = GenerationError::QuotaExceeded("limit".into());
        assert!(quota.user_message().contains("Rate limit"));

        let blocked = GenerationError::SafetyBlocked { reason: "IMAGE_SAFETY".into() };
        assert!(blocked.user_message().contains("IMAGE_SAFETY"));
    }
}
