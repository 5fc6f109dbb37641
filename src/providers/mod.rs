//! Provider adapters.
//!
//! Each adapter hides one remote service's wire format behind the
//! [`LlmProvider`] contract. Adapters are infallible at their boundary:
//! `generate` always returns a response (failures land in its `error` field)
//! and `stream_generate` always yields a terminal chunk, carrying the error
//! in its metadata when the stream aborts.

pub mod claude;
pub mod custom;
pub mod gemini;
pub mod openai;
mod retry;
mod sse;

pub(crate) use retry::{RetryConfig, RetryPolicy};
pub(crate) use sse::SseParser;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, ChunkStream, LlmRequest, LlmResponse};

/// Words-to-tokens multiplier used when exact tokenization is unavailable.
pub(crate) const TOKENS_PER_WORD: f64 = 1.3;

/// Word-group size for simulated streaming.
pub(crate) const SIMULATED_CHUNK_WORDS: usize = 5;

/// Sampling temperature when neither the request nor the manager sets one.
pub(crate) const DEFAULT_TEMPERATURE: f32 = 0.7;

/// The contract every remote provider is adapted to.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Establish and validate connectivity with a minimal round trip.
    /// Never errors; a `false` return means the manager treats the provider
    /// as unavailable.
    async fn initialize(&self) -> bool;

    fn is_available(&self) -> bool;

    /// Perform exactly one generation call. All failure modes are folded
    /// into an error response; latency is recorded either way.
    async fn generate(&self, request: &LlmRequest) -> LlmResponse;

    /// Produce a lazy, finite chunk sequence. Providers without native
    /// incremental delivery generate the full response and re-chunk it.
    async fn stream_generate(&self, request: &LlmRequest) -> ChunkStream;

    /// Pre-flight cost estimate from the word-count heuristic and the
    /// provider's rate table. Not billing-grade.
    fn estimate_cost(&self, request: &LlmRequest) -> f64;

    /// Minimal 1-token generation probe.
    async fn health_check(&self) -> bool {
        let probe = LlmRequest::new(vec![ChatMessage::user("ping")]).with_max_tokens(1);
        self.generate(&probe).await.error.is_none()
    }
}

/// Construct the adapter matching `config.name`.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match config.name.as_str() {
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(config.clone())?)),
        "gemini" => Ok(Arc::new(gemini::GeminiProvider::new(config.clone())?)),
        "claude" => Ok(Arc::new(claude::ClaudeProvider::new(config.clone())?)),
        "custom" => Ok(Arc::new(custom::CustomProvider::new(config.clone())?)),
        other => Err(ProviderError::configuration(
            other,
            "unknown provider type",
        )),
    }
}

/// Estimated token count for a block of text.
pub(crate) fn estimate_tokens(text: &str) -> f64 {
    text.split_whitespace().count() as f64 * TOKENS_PER_WORD
}

/// Split text into fixed word groups for simulated streaming. Each piece
/// keeps a trailing space so concatenation reproduces the text modulo
/// whitespace.
pub(crate) fn chunk_words(text: &str, group: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(group.max(1))
        .map(|chunk| format!("{} ", chunk.join(" ")))
        .collect()
}

/// Shared HTTP client construction with the configured timeouts.
pub(crate) fn build_http_client(timeout_secs: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::network("http", format!("failed to build HTTP client: {e}")))
}

/// Map an HTTP error status to the provider error taxonomy.
pub(crate) fn map_http_error(provider: &str, status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::authentication(provider, "invalid or missing API key"),
        429 if body.contains("insufficient_quota") => {
            ProviderError::quota_exceeded(provider, body.to_string())
        }
        429 => ProviderError::rate_limit(provider, extract_retry_after(body)),
        _ => ProviderError::api(provider, status, body.to_string()),
    }
}

/// Best-effort retry-after extraction from an error body.
fn extract_retry_after(body: &str) -> Option<u64> {
    let json: Value = serde_json::from_str(body).ok()?;
    if let Some(retry_after) = json.get("retry_after").and_then(Value::as_u64) {
        return Some(retry_after);
    }
    json.get("error")?.get("retry_after")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_uses_word_multiplier() {
        assert_eq!(estimate_tokens(""), 0.0);
        let estimate = estimate_tokens("one two three four");
        assert!((estimate - 5.2).abs() < 1e-9);
    }

    #[test]
    fn chunking_preserves_content() {
        let text = "a b c d e f g h i j k l";
        let chunks = chunk_words(text, 5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "a b c d e ");
        assert_eq!(chunks[2], "k l ");

        let rejoined = chunks.concat();
        assert_eq!(
            rejoined.split_whitespace().collect::<Vec<_>>(),
            text.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[test]
    fn chunking_empty_text_yields_nothing() {
        assert!(chunk_words("", 5).is_empty());
    }

    #[test]
    fn http_errors_map_to_taxonomy() {
        assert!(matches!(
            map_http_error("openai", 401, ""),
            ProviderError::Authentication { .. }
        ));
        assert!(matches!(
            map_http_error("openai", 429, r#"{"retry_after": 30}"#),
            ProviderError::RateLimit {
                retry_after: Some(30),
                ..
            }
        ));
        assert!(matches!(
            map_http_error("openai", 429, r#"{"error": {"code": "insufficient_quota"}}"#),
            ProviderError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            map_http_error("openai", 503, "overloaded"),
            ProviderError::Api { status: 503, .. }
        ));
    }

    #[test]
    fn unknown_provider_type_is_rejected() {
        let config = crate::config::ProviderConfig::new("mystery", "k", "m");
        assert!(build_provider(&config).is_err());
    }
}
