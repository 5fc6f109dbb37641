//! Normalized generation response and streaming chunk.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Token usage and the cost estimate derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Estimated cost in USD. Pre-flight estimates, not billing-grade.
    pub estimated_cost: f64,
}

/// Result of one provider attempt.
///
/// Exactly one of content/error carries meaning: a response with `error` set
/// has empty content and is never treated as a valid answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub request_id: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    pub provider: String,
    pub latency_ms: f64,
    pub error: Option<String>,
}

impl LlmResponse {
    /// An error response with empty content.
    pub fn failure(request_id: &str, provider: &str, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: String::new(),
            finish_reason: None,
            usage: None,
            model: None,
            provider: provider.to_string(),
            latency_ms: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Incremental unit of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub is_final: bool,
    /// Carries `"error"` when the stream aborts.
    pub metadata: HashMap<String, Value>,
}

impl StreamChunk {
    /// A content fragment.
    pub fn part(request_id: &str, content: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: content.into(),
            finish_reason: None,
            is_final: false,
            metadata: HashMap::new(),
        }
    }

    /// An empty terminal chunk ending a successful stream.
    pub fn terminal(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: String::new(),
            finish_reason: None,
            is_final: true,
            metadata: HashMap::new(),
        }
    }

    /// A terminal chunk carrying a stream-abort error in its metadata.
    pub fn terminal_error(request_id: &str, error: impl Into<String>) -> Self {
        let mut chunk = Self::terminal(request_id);
        chunk
            .metadata
            .insert("error".to_string(), Value::String(error.into()));
        chunk
    }

    /// The embedded error, if the stream aborted.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

/// A lazy, finite, non-restartable chunk sequence.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_responses_have_empty_content() {
        let response = LlmResponse::failure("req-1", "openai", "boom");
        assert!(response.content.is_empty());
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert!(!response.is_success());
    }

    #[test]
    fn terminal_error_chunk_round_trips() {
        let chunk = StreamChunk::terminal_error("req-1", "connection reset");
        assert!(chunk.is_final);
        assert!(chunk.content.is_empty());
        assert_eq!(chunk.error(), Some("connection reset"));

        let plain = StreamChunk::part("req-1", "hello ");
        assert!(plain.error().is_none());
        assert!(!plain.is_final);
    }
}
