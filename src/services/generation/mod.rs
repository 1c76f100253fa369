// Generation client: request building, response normalization and the
// retry/model-fallback wrapper around the hosted image model.

pub mod fallback;
pub mod gemini;
pub mod plan;
pub mod prompts;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::errors::GenerationError;
use crate::core::types::{CaptionPair, ImagePayload};

pub use fallback::GenerationClient;
pub use gemini::{validate_api_key, GeminiClient};

/// One image-generation call, independent of the model it is sent to.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub reference_image: Option<ImagePayload>,
    pub aspect_ratio: &'static str,
}

impl ImageRequest {
    pub fn square(prompt: String, reference_image: Option<ImagePayload>) -> Self {
        Self {
            prompt,
            reference_image,
            aspect_ratio: "1:1",
        }
    }
}

/// Raw transport to an image-generating model.
///
/// Implementations translate transport failures into the `GenerationError`
/// taxonomy but never retry on their own.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate_image(
        &self,
        model: &str,
        request: &ImageRequest,
    ) -> Result<ImagePayload, GenerationError>;
}

/// Turns a free-text usage context into an ordered list of caption pairs.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn generate_plan(
        &self,
        count: usize,
        context: &str,
    ) -> Result<Vec<CaptionPair>, GenerationError>;
}

/// The two image-generating operations the scheduler depends on.
#[async_trait]
pub trait StickerGenerator: Send + Sync {
    /// One subject expressing `caption`, white background, no rendered text.
    async fn generate_single(
        &self,
        caption: &str,
        style_prompt: &str,
        reference_image: Option<&ImagePayload>,
        cancel: &CancellationToken,
    ) -> Result<ImagePayload, GenerationError>;

    /// One 2x2 image holding up to four poses in reading order.
    async fn generate_grid(
        &self,
        captions: &[String],
        style_prompt: &str,
        reference_image: Option<&ImagePayload>,
        cancel: &CancellationToken,
    ) -> Result<ImagePayload, GenerationError>;
}
