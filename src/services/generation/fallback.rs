use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::prompts::{grid_image_prompt, single_image_prompt};
use super::{ImageBackend, ImageRequest, StickerGenerator};
use crate::core::config::ApiConfig;
use crate::core::errors::GenerationError;
use crate::core::types::ImagePayload;
use crate::middleware::{cancellable, Backoff, RetryPolicy};
use crate::utils::Metrics;

/// Retry/model-fallback wrapper around an [`ImageBackend`].
///
/// Each candidate model gets its own attempt budget. A retryable failure that
/// exhausts the budget moves on to the next model; anything non-retryable is
/// returned at once.
pub struct GenerationClient {
    backend: Arc<dyn ImageBackend>,
    models: Vec<String>,
    policy: RetryPolicy,
    metrics: Option<Metrics>,
}

impl GenerationClient {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        models: Vec<String>,
        policy: RetryPolicy,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            backend,
            models,
            policy,
            metrics,
        }
    }

    /// Build from the API section: candidate models in order, linear backoff.
    pub fn from_config(backend: Arc<dyn ImageBackend>, config: &ApiConfig, metrics: Option<Metrics>) -> Self {
        let policy = RetryPolicy::new(
            config.attempts_per_model,
            Backoff::Linear {
                step: config.backoff_step,
                base: config.backoff_base,
            },
        );
        Self::new(backend, config.image_models.clone(), policy, metrics)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    async fn generate_with_fallback(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<ImagePayload, GenerationError> {
        let mut last_error = None;

        for (index, model) in self.models.iter().enumerate() {
            if index > 0 {
                info!("Falling back to model {} ({}/{})", model, index + 1, self.models.len());
                if let Some(ref m) = self.metrics {
                    m.record_model_fallback();
                }
            }

            let backend = &self.backend;
            let metrics = &self.metrics;
            let result = self
                .policy
                .run(cancel, model, |attempt| async move {
                    if let Some(m) = metrics {
                        m.record_model_call(model);
                        if attempt > 1 {
                            m.record_retry();
                        }
                    }
                    cancellable(cancel, backend.generate_image(model, request)).await
                })
                .await;

            match result {
                Ok(image) => return Ok(image),
                Err(e) if e.is_retryable() => {
                    warn!("Model {} exhausted its attempts: {}", model, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GenerationError::MalformedRequest("no candidate image models configured".to_string())
        }))
    }
}

#[async_trait]
impl StickerGenerator for GenerationClient {
    #[instrument(skip(self, style_prompt, reference_image, cancel))]
    async fn generate_single(
        &self,
        caption: &str,
        style_prompt: &str,
        reference_image: Option<&ImagePayload>,
        cancel: &CancellationToken,
    ) -> Result<ImagePayload, GenerationError> {
        if caption.trim().is_empty() {
            return Err(GenerationError::MalformedRequest("caption must not be empty".to_string()));
        }

        let request = ImageRequest::square(
            single_image_prompt(caption, style_prompt, reference_image.is_some()),
            reference_image.cloned(),
        );
        self.generate_with_fallback(&request, cancel).await
    }

    #[instrument(skip(self, style_prompt, reference_image, cancel), fields(count = captions.len()))]
    async fn generate_grid(
        &self,
        captions: &[String],
        style_prompt: &str,
        reference_image: Option<&ImagePayload>,
        cancel: &CancellationToken,
    ) -> Result<ImagePayload, GenerationError> {
        if captions.is_empty() || captions.len() > 4 {
            return Err(GenerationError::MalformedRequest(format!(
                "grid requests take 1 to 4 captions, got {}",
                captions.len()
            )));
        }

        let request = ImageRequest::square(
            grid_image_prompt(captions, style_prompt, reference_image.is_some()),
            reference_image.cloned(),
        );
        self.generate_with_fallback(&request, cancel).await
    }
}
