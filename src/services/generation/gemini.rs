use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::plan::parse_plan_response;
use super::prompts::{plan_prompt, plan_response_schema};
use super::{ImageBackend, ImageRequest, PlanSource};
use crate::core::config::ApiConfig;
use crate::core::errors::{CredentialProblem, GenerationError};
use crate::core::types::{CaptionPair, ImagePayload};
use crate::utils::Metrics;

/// Finish reasons that mean the content filter stopped the response
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "IMAGE_SAFETY",
    "SPII",
    "RECITATION",
];

/// Gemini generateContent client for both image generation and planning.
///
/// Performs exactly one HTTP request per call. Retrying and model fallback
/// live in [`super::GenerationClient`].
pub struct GeminiClient {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    plan_model: String,
    primary_language: String,
    alternate_language: String,
    metrics: Option<Metrics>,
}

impl GeminiClient {
    /// Create a client, failing fast when the credential is missing or has
    /// the wrong shape.
    pub fn new(config: &ApiConfig, metrics: Option<Metrics>) -> Result<Self, GenerationError> {
        let api_key = validate_api_key(config.api_key.as_deref())?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::TransientOrUnknown(format!("failed to create HTTP client: {}", e)))?;

        info!(
            "Gemini client ready (plan model: {}, base url: {})",
            config.plan_model, config.base_url
        );

        Ok(Self {
            http_client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            plan_model: config.plan_model.clone(),
            primary_language: config.primary_language.clone(),
            alternate_language: config.alternate_language.clone(),
            metrics,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// POST one request and return the parsed JSON body, classifying failures.
    async fn send(&self, model: &str, body: &serde_json::Value) -> Result<serde_json::Value, GenerationError> {
        let start = Instant::now();
        let result = self.send_inner(model, body).await;
        let duration = start.elapsed();

        if let Some(ref m) = self.metrics {
            match &result {
                Ok(response) => {
                    let (input_tokens, output_tokens) = extract_token_usage(response);
                    m.record_api_call(true, duration, input_tokens, output_tokens);
                }
                Err(_) => m.record_api_call(false, duration, 0, 0),
            }
        }

        result
    }

    async fn send_inner(&self, model: &str, body: &serde_json::Value) -> Result<serde_json::Value, GenerationError> {
        let response = self
            .http_client
            .post(self.endpoint(model))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_transport_failure)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(classify_transport_failure)?;

        if !status.is_success() {
            let error = classify_http_failure(status, &text);
            warn!("{} request failed with status {}: {}", model, status, error);
            return Err(error);
        }

        serde_json::from_str(&text).map_err(|e| {
            GenerationError::TransientOrUnknown(format!("unparseable response body: {}", e))
        })
    }
}

#[async_trait]
impl ImageBackend for GeminiClient {
    #[instrument(skip(self, request), fields(has_reference = request.reference_image.is_some()))]
    async fn generate_image(
        &self,
        model: &str,
        request: &ImageRequest,
    ) -> Result<ImagePayload, GenerationError> {
        let mut parts = vec![serde_json::json!({"text": request.prompt})];
        if let Some(ref reference) = request.reference_image {
            parts.push(serde_json::json!({
                "inline_data": {
                    "mime_type": reference.mime_type,
                    "data": reference.to_base64()
                }
            }));
        }

        let body = serde_json::json!({
            "contents": [{
                "parts": parts
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio
                }
            }
        });

        let response = self.send(model, &body).await?;
        let image = interpret_image_response(&response)?;
        debug!("{} returned {} ({} bytes)", model, image.mime_type, image.len());
        Ok(image)
    }
}

#[async_trait]
impl PlanSource for GeminiClient {
    #[instrument(skip(self, context), fields(model = %self.plan_model))]
    async fn generate_plan(
        &self,
        count: usize,
        context: &str,
    ) -> Result<Vec<CaptionPair>, GenerationError> {
        if count == 0 {
            return Err(GenerationError::MalformedRequest(
                "plan size must be at least 1".to_string(),
            ));
        }

        let prompt = plan_prompt(count, context, &self.primary_language, &self.alternate_language);
        let body = serde_json::json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "response_mime_type": "application/json",
                "response_schema": plan_response_schema()
            }
        });

        let response = self.send(&self.plan_model, &body).await?;
        let plan = parse_plan_response(&response, count)?;
        info!("Planned {} captions (requested {})", plan.len(), count);
        Ok(plan)
    }
}

/// Check the configured key and return it trimmed.
///
/// Distinguishes a missing key from a value shaped like a project id
/// (lowercase words joined by hyphens, or a bare project number).
pub fn validate_api_key(raw: Option<&str>) -> Result<String, GenerationError> {
    let key = raw.map(str::trim).unwrap_or_default();
    if key.is_empty() {
        return Err(GenerationError::InvalidCredential(CredentialProblem::NotConfigured));
    }

    if key.starts_with("AIza") {
        let well_formed = key.len() >= 30
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        return if well_formed {
            Ok(key.to_string())
        } else {
            Err(GenerationError::InvalidCredential(CredentialProblem::Malformed))
        };
    }

    let is_project_number = key.chars().all(|c| c.is_ascii_digit());
    let is_project_id = key.len() <= 30
        && key.starts_with(|c: char| c.is_ascii_lowercase())
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if is_project_number || is_project_id {
        Err(GenerationError::InvalidCredential(CredentialProblem::LooksLikeProjectId))
    } else {
        Err(GenerationError::InvalidCredential(CredentialProblem::Malformed))
    }
}

/// Map a non-success HTTP status and body onto the error taxonomy.
pub fn classify_http_failure(status: StatusCode, body: &str) -> GenerationError {
    let message = extract_error_message(body);
    let detail = format!("{} - {}", status.as_u16(), message);

    match status.as_u16() {
        429 => GenerationError::QuotaExceeded(detail),
        401 | 403 => GenerationError::InvalidCredential(CredentialProblem::Rejected(message)),
        400 if message.contains("API key not valid") || message.contains("API_KEY_INVALID") => {
            GenerationError::InvalidCredential(CredentialProblem::Rejected(message))
        }
        400 => GenerationError::MalformedRequest(detail),
        _ => GenerationError::TransientOrUnknown(detail),
    }
}

fn classify_transport_failure(error: reqwest::Error) -> GenerationError {
    // Request URLs never reach error details
    let error = error.without_url();
    if error.is_timeout() {
        GenerationError::TransientOrUnknown(format!("request timed out: {}", error))
    } else if error.is_connect() {
        GenerationError::TransientOrUnknown(format!("service unavailable: {}", error))
    } else {
        GenerationError::TransientOrUnknown(format!("HTTP request failed: {}", error))
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

/// Pull the first image out of a generateContent response.
pub fn interpret_image_response(response: &serde_json::Value) -> Result<ImagePayload, GenerationError> {
    if let Some(reason) = response["promptFeedback"]["blockReason"].as_str() {
        return Err(GenerationError::SafetyBlocked {
            reason: reason.to_string(),
        });
    }

    let candidate = &response["candidates"][0];
    if let Some(reason) = candidate["finishReason"].as_str() {
        if SAFETY_FINISH_REASONS.contains(&reason) {
            return Err(GenerationError::SafetyBlocked {
                reason: reason.to_string(),
            });
        }
    }

    let inline_data = candidate["content"]["parts"]
        .as_array()
        .and_then(|parts| {
            parts.iter().find_map(|part| {
                let data = &part["inline_data"];
                if data.is_object() {
                    return Some(data);
                }
                let data = &part["inlineData"];
                data.is_object().then_some(data)
            })
        })
        .ok_or(GenerationError::NoImageReturned)?;

    let encoded = inline_data["data"]
        .as_str()
        .ok_or(GenerationError::NoImageReturned)?;
    let mime_type = inline_data["mime_type"]
        .as_str()
        .or_else(|| inline_data["mimeType"].as_str())
        .unwrap_or("image/png");

    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| GenerationError::TransientOrUnknown(format!("invalid image data: {}", e)))?;
    if bytes.is_empty() {
        return Err(GenerationError::NoImageReturned);
    }

    Ok(ImagePayload::new(mime_type, bytes))
}

/// Extract token usage from Gemini API response
///
/// Returns (input_tokens, output_tokens) if available, otherwise (0, 0)
fn extract_token_usage(response: &serde_json::Value) -> (u64, u64) {
    let usage_metadata = &response["usageMetadata"];
    let input_tokens = usage_metadata["promptTokenCount"].as_u64().unwrap_or(0);
    let output_tokens = usage_metadata["candidatesTokenCount"].as_u64().unwrap_or(0);

    (input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID_KEY: &str = "AIzaSyA1234567890abcdefghijklmnopqrstu";

    #[test]
    fn test_missing_key_is_not_configured() {
        assert!(matches!(
            validate_api_key(None),
            Err(GenerationError::InvalidCredential(CredentialProblem::NotConfigured))
        ));
        assert!(matches!(
            validate_api_key(Some("   ")),
            Err(GenerationError::InvalidCredential(CredentialProblem::NotConfigured))
        ));
    }

    #[test]
    fn test_project_id_is_detected() {
        for value in ["my-sticker-project", "gen-lang-client-0123456789", "123456789012"] {
            assert!(
                matches!(
                    validate_api_key(Some(value)),
                    Err(GenerationError::InvalidCredential(CredentialProblem::LooksLikeProjectId))
                ),
                "{} should look like a project id",
                value
            );
        }
    }

    #[test]
    fn test_malformed_key() {
        assert!(matches!(
            validate_api_key(Some("sk-NotAGoogleKey!")),
            Err(GenerationError::InvalidCredential(CredentialProblem::Malformed))
        ));
        assert!(matches!(
            validate_api_key(Some("AIzaShort")),
            Err(GenerationError::InvalidCredential(CredentialProblem::Malformed))
        ));
    }

    #[test]
    fn test_valid_key_is_trimmed() {
        let key = validate_api_key(Some(&format!(" {} ", VALID_KEY))).unwrap();
        assert_eq!(key, VALID_KEY);
    }

    #[test]
    fn test_client_creation_fails_fast_without_key() {
        let config = ApiConfig {
            api_key: None,
            ..ApiConfig::default()
        };
        assert!(matches!(
            GeminiClient::new(&config, None),
            Err(GenerationError::InvalidCredential(CredentialProblem::NotConfigured))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_never_exposes_key() {
        let config = ApiConfig {
            api_key: Some(VALID_KEY.to_string()),
            base_url: "http://127.0.0.1:9".to_string(),
            ..ApiConfig::default()
        };
        let client = GeminiClient::new(&config, None).unwrap();
        let request = ImageRequest::square("a cat".to_string(), None);

        let err = client.generate_image("m", &request).await.unwrap_err();
        assert!(!err.user_message().contains(VALID_KEY));
        assert!(!err.to_string().contains(VALID_KEY));
        assert!(!client.endpoint("m").contains(VALID_KEY));
    }

    #[test]
    fn test_classify_http_failures() {
        let quota = classify_http_failure(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Resource has been exhausted (e.g. check quota)."}}"#,
        );
        assert!(matches!(quota, GenerationError::QuotaExceeded(_)));
        assert!(quota.is_retryable());

        let overloaded = classify_http_failure(StatusCode::SERVICE_UNAVAILABLE, "The model is overloaded");
        assert!(matches!(overloaded, GenerationError::TransientOrUnknown(_)));
        assert!(overloaded.is_retryable());

        let bad_key = classify_http_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"API key not valid. Please pass a valid API key."}}"#,
        );
        assert!(bad_key.is_fatal());

        let forbidden = classify_http_failure(StatusCode::FORBIDDEN, "denied");
        assert!(forbidden.is_fatal());

        let malformed = classify_http_failure(StatusCode::BAD_REQUEST, "Invalid JSON payload");
        assert!(matches!(malformed, GenerationError::MalformedRequest(_)));
        assert!(!malformed.is_retryable());

        let internal = classify_http_failure(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(!internal.is_retryable());
    }

    #[test]
    fn test_interpret_image_response_finds_first_image_part() {
        let data = general_purpose::STANDARD.encode([1u8, 2, 3]);
        let response = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is your sticker"},
                    {"inlineData": {"mimeType": "image/png", "data": data}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let image = interpret_image_response(&response).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_interpret_image_response_without_image() {
        let response = json!({
            "candidates": [{
                "content": {"parts": [{"text": "I cannot draw that"}]},
                "finishReason": "STOP"
            }]
        });
        assert!(matches!(
            interpret_image_response(&response),
            Err(GenerationError::NoImageReturned)
        ));
    }

    #[test]
    fn test_interpret_image_response_safety() {
        let response = json!({
            "candidates": [{"finishReason": "IMAGE_SAFETY"}]
        });
        match interpret_image_response(&response) {
            Err(GenerationError::SafetyBlocked { reason }) => assert_eq!(reason, "IMAGE_SAFETY"),
            other => panic!("unexpected: {:?}", other),
        }

        let blocked = json!({"promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}});
        assert!(matches!(
            interpret_image_response(&blocked),
            Err(GenerationError::SafetyBlocked { .. })
        ));
    }

    #[test]
    fn test_extract_token_usage() {
        let response = json!({"usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 1290}});
        assert_eq!(extract_token_usage(&response), (12, 1290));
        assert_eq!(extract_token_usage(&json!({})), (0, 0));
    }
}
