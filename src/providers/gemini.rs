//! Google Gemini provider adapter.
//!
//! Uses the `generateContent` REST endpoint with key-in-query auth. The API
//! has no chat-role concept compatible with ours, so the conversation is
//! flattened into a single role-prefixed prompt. Streaming is simulated:
//! the full response is generated, then re-chunked in word groups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    build_http_client, chunk_words, estimate_tokens, map_http_error, LlmProvider, RetryConfig,
    RetryPolicy, DEFAULT_TEMPERATURE, SIMULATED_CHUNK_WORDS,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, ChunkStream, LlmRequest, LlmResponse, StreamChunk, Usage};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// Flat per-token rates; Gemini pricing does not vary across the models we
// route to.
const INPUT_RATE: f64 = 0.000_125;
const OUTPUT_RATE: f64 = 0.000_375;

pub struct GeminiProvider {
    config: ProviderConfig,
    client: Client,
    retry: RetryPolicy,
    available: AtomicBool,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_http_client(config.timeout_secs)?;
        let retry = RetryPolicy::new(RetryConfig::with_attempts(config.retry_attempts));
        Ok(Self {
            config,
            client,
            retry,
            available: AtomicBool::new(false),
        })
    }

    fn model_for(&self, request: &LlmRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// Collapse the conversation into one prompt, keeping role markers so
    /// the model can still distinguish speakers.
    fn flatten_messages(messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        let prompt = Self::flatten_messages(&request.messages);
        json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens.unwrap_or(self.config.max_tokens),
                "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            }
        })
    }

    async fn call_api(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let model = self.model_for(request);
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/'),
            model,
            self.config.api_key,
        );
        let body = self.request_body(request);

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| ProviderError::timeout(PROVIDER, "request timed out"))?
        .map_err(|e| ProviderError::network(PROVIDER, e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::network(PROVIDER, e.to_string()))?;
        if status != 200 {
            return Err(map_http_error(PROVIDER, status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::response_parsing(PROVIDER, e.to_string()))?;
        let content = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::response_parsing(PROVIDER, "missing candidate text"))?
            .to_string();
        let finish_reason = value["candidates"][0]["finishReason"]
            .as_str()
            .map(str::to_string);

        // No usage block in the response; estimate from word counts.
        let prompt_tokens =
            estimate_tokens(&Self::flatten_messages(&request.messages)).round() as u32;
        let completion_tokens = estimate_tokens(&content).round() as u32;

        Ok(LlmResponse {
            request_id: request.id.clone(),
            content,
            finish_reason,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                estimated_cost: prompt_tokens as f64 * INPUT_RATE
                    + completion_tokens as f64 * OUTPUT_RATE,
            }),
            model: Some(model),
            provider: PROVIDER.to_string(),
            latency_ms: 0.0,
            error: None,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn initialize(&self) -> bool {
        let probe = LlmRequest::new(vec![ChatMessage::user("Hello")]).with_max_tokens(1);
        match self.call_api(&probe).await {
            Ok(_) => {
                debug!("gemini provider initialized");
                self.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("gemini provider failed to initialize: {e}");
                false
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn generate(&self, request: &LlmRequest) -> LlmResponse {
        let start = Instant::now();
        match self.retry.call(|| self.call_api(request)).await {
            Ok(response) => response.with_latency(start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => LlmResponse::failure(&request.id, PROVIDER, e.to_string())
                .with_latency(start.elapsed().as_secs_f64() * 1000.0),
        }
    }

    async fn stream_generate(&self, request: &LlmRequest) -> ChunkStream {
        let response = self.generate(request).await;
        let request_id = request.id.clone();

        Box::pin(stream! {
            if let Some(error) = response.error {
                yield StreamChunk::terminal_error(&request_id, error);
                return;
            }
            let pieces = chunk_words(&response.content, SIMULATED_CHUNK_WORDS);
            if pieces.is_empty() {
                let mut terminal = StreamChunk::terminal(&request_id);
                terminal.finish_reason = response.finish_reason;
                yield terminal;
                return;
            }
            // The last content chunk doubles as the terminal chunk.
            let last = pieces.len() - 1;
            for (i, piece) in pieces.into_iter().enumerate() {
                let mut chunk = StreamChunk::part(&request_id, &piece);
                if i == last {
                    chunk.is_final = true;
                    chunk.finish_reason = response.finish_reason.clone();
                }
                yield chunk;
            }
        })
    }

    fn estimate_cost(&self, request: &LlmRequest) -> f64 {
        let input_tokens: f64 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);
        input_tokens * INPUT_RATE + max_tokens as f64 * OUTPUT_RATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_provider(base_url: &str) -> GeminiProvider {
        let config =
            ProviderConfig::new("gemini", "g-key", "gemini-pro").with_base_url(base_url);
        GeminiProvider::new(config).unwrap()
    }

    fn request() -> LlmRequest {
        LlmRequest::new(vec![ChatMessage::user("Tell me a story")])
    }

    fn candidate_body(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": {"parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        })
    }

    #[tokio::test]
    async fn generate_flattens_and_estimates_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(candidate_body("Once upon a time")),
            )
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let response = provider.generate(&request()).await;

        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.content, "Once upon a time");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));

        let usage = response.usage.unwrap();
        // 4 words * 1.3 rounded
        assert_eq!(usage.completion_tokens, 5);
        assert!(usage.estimated_cost > 0.0);
    }

    #[tokio::test]
    async fn simulated_stream_rechunks_full_response() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate_body(text)))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let mut stream = provider.stream_generate(&request()).await;

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        // 12 words in groups of 5; the last content chunk is the terminal.
        assert_eq!(chunks.len(), 3);
        assert!(chunks[..2].iter().all(|c| !c.is_final));
        assert!(chunks[2].is_final);
        assert!(!chunks[2].content.is_empty());
        assert_eq!(chunks[2].finish_reason.as_deref(), Some("STOP"));

        let rejoined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(
            rejoined.split_whitespace().collect::<Vec<_>>(),
            text.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn upstream_failure_surfaces_as_terminal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let mut stream = provider.stream_generate(&request()).await;

        let chunk = stream.next().await.unwrap();
        assert!(chunk.is_final);
        assert!(chunk.error().is_some());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn flattened_prompt_keeps_role_markers() {
        let prompt = GeminiProvider::flatten_messages(&[
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
        ]);
        assert_eq!(prompt, "system: Be brief.\nuser: Hi");
    }
}
