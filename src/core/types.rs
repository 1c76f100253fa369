// Shared data model: plan items, ledger entries, run context

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::errors::ConfigError;

/// Opaque encoded image (PNG or JPEG bytes plus MIME type).
///
/// Cloning is cheap; the bytes are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: Arc::new(data),
        }
    }

    pub fn png(data: Vec<u8>) -> Self {
        Self::new("image/png", data)
    }

    pub fn jpeg(data: Vec<u8>) -> Self {
        Self::new("image/jpeg", data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.data.as_slice())
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One caption pair returned by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionPair {
    pub caption_local: String,
    pub caption_alt: String,
}

/// Unit of work in a plan. `id` is the item's index in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: usize,
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_alt: Option<String>,
}

impl PlanItem {
    /// Build a plan from captions, assigning contiguous ids from 0.
    pub fn from_captions<I, S>(captions: I) -> Vec<PlanItem>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        captions
            .into_iter()
            .enumerate()
            .map(|(id, caption)| PlanItem {
                id,
                caption: caption.into(),
                caption_alt: None,
            })
            .collect()
    }

    pub fn from_pairs(pairs: Vec<CaptionPair>) -> Vec<PlanItem> {
        pairs
            .into_iter()
            .enumerate()
            .map(|(id, pair)| PlanItem {
                id,
                caption: pair.caption_local,
                caption_alt: Some(pair.caption_alt),
            })
            .collect()
    }
}

/// Per-item generation status.
///
/// pending -> generating -> success | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Generating,
    Success,
    Error,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Ledger entry for one plan item. Replaced as a whole on every update.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub id: usize,
    pub caption_snapshot: String,
    pub raw_image: Option<ImagePayload>,
    pub processed_image: Option<ImagePayload>,
    pub status: ItemStatus,
    pub error_detail: Option<String>,
}

impl GenerationResult {
    pub fn pending(item: &PlanItem) -> Self {
        Self {
            id: item.id,
            caption_snapshot: item.caption.clone(),
            raw_image: None,
            processed_image: None,
            status: ItemStatus::Pending,
            error_detail: None,
        }
    }

    pub fn generating(item: &PlanItem) -> Self {
        Self {
            status: ItemStatus::Generating,
            ..Self::pending(item)
        }
    }

    pub fn succeeded(item: &PlanItem, raw_image: ImagePayload, processed_image: ImagePayload) -> Self {
        Self {
            raw_image: Some(raw_image),
            processed_image: Some(processed_image),
            status: ItemStatus::Success,
            ..Self::pending(item)
        }
    }

    pub fn failed(item: &PlanItem, detail: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Error,
            error_detail: Some(detail.into()),
            ..Self::pending(item)
        }
    }
}

/// Read-only view of a ledger entry, serialized for consumers
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntryView {
    pub id: usize,
    pub caption: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_image: Option<String>,
}

impl From<&GenerationResult> for LedgerEntryView {
    fn from(result: &GenerationResult) -> Self {
        Self {
            id: result.id,
            caption: result.caption_snapshot.clone(),
            status: result.status,
            error_detail: result.error_detail.clone(),
            raw_image: result.raw_image.as_ref().map(ImagePayload::to_data_url),
            processed_image: result.processed_image.as_ref().map(ImagePayload::to_data_url),
        }
    }
}

/// Status tally over a ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub generating: usize,
    pub success: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.generating + self.success + self.error
    }

    pub fn unfinished(&self) -> usize {
        self.pending + self.generating
    }
}

/// Batching strategy used to walk a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One item at a time, fixed cooldown between retries
    Serial,
    /// Up to four captions per request, sliced from a 2x2 grid image
    Grid,
    /// Small batches of concurrent single-image requests
    Parallel,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "grid" => Ok(Self::Grid),
            "parallel" | "small-parallel" => Ok(Self::Parallel),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Grid => write!(f, "grid"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Everything scoped to one generation run.
///
/// The reference image and style prompt are read-only for the whole run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: u64,
    pub cancellation: CancellationToken,
    pub reference_image: Option<ImagePayload>,
    pub style_prompt: String,
}

impl RunContext {
    pub fn new(run_id: u64, reference_image: Option<ImagePayload>, style_prompt: impl Into<String>) -> Self {
        Self {
            run_id,
            cancellation: CancellationToken::new(),
            reference_image,
            style_prompt: style_prompt.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
