//! Anthropic Claude provider adapter.
//!
//! Talks to `/v1/messages` with `x-api-key` auth. System messages are not
//! part of the messages array in this API; they are lifted into the
//! top-level `system` field. Streaming is native SSE driven by
//! `content_block_delta` events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    build_http_client, estimate_tokens, map_http_error, LlmProvider, RetryConfig, RetryPolicy,
    SseParser, DEFAULT_TEMPERATURE,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, ChunkStream, LlmRequest, LlmResponse, MessageRole, StreamChunk, Usage};

const PROVIDER: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const FALLBACK_RATE_KEY: &str = "sonnet";

pub struct ClaudeProvider {
    config: ProviderConfig,
    client: Client,
    retry: RetryPolicy,
    /// (input $/token, output $/token) keyed by model-family substring.
    rates: HashMap<&'static str, (f64, f64)>,
    available: AtomicBool,
}

impl ClaudeProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_http_client(config.timeout_secs)?;
        let retry = RetryPolicy::new(RetryConfig::with_attempts(config.retry_attempts));

        let mut rates = HashMap::new();
        rates.insert("sonnet", (0.000_015, 0.000_075));
        rates.insert("haiku", (0.000_000_25, 0.000_001_25));

        Ok(Self {
            config,
            client,
            retry,
            rates,
            available: AtomicBool::new(false),
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn model_for(&self, request: &LlmRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// Rates are keyed by family substring so dated model names
    /// ("claude-3-5-sonnet-20241022") match without a full table.
    fn rates_for(&self, model: &str) -> (f64, f64) {
        for (family, rates) in &self.rates {
            if model.contains(family) {
                return *rates;
            }
        }
        self.rates
            .get(FALLBACK_RATE_KEY)
            .copied()
            .unwrap_or((0.0, 0.0))
    }

    /// System messages go to the `system` field; the rest stay in order.
    fn split_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n"))
        };

        let chat = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        (system, chat)
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let (system, messages) = Self::split_messages(&request.messages);
        let mut body = json!({
            "model": self.model_for(request),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url().trim_end_matches('/'));

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", API_VERSION)
                .json(body)
                .send(),
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

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::response_parsing(PROVIDER, e.to_string()))
    }

    async fn call_api(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let model = self.model_for(request);
        let body = self.request_body(request, false);
        let value = self.send(&body).await?;

        let content = value["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::response_parsing(PROVIDER, "missing content text"))?
            .to_string();
        let finish_reason = value["stop_reason"].as_str().map(str::to_string);

        let prompt_tokens = value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
        let (input_rate, output_rate) = self.rates_for(&model);

        Ok(LlmResponse {
            request_id: request.id.clone(),
            content,
            finish_reason,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                estimated_cost: prompt_tokens as f64 * input_rate
                    + completion_tokens as f64 * output_rate,
            }),
            model: Some(model),
            provider: PROVIDER.to_string(),
            latency_ms: 0.0,
            error: None,
        })
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn initialize(&self) -> bool {
        let probe = LlmRequest::new(vec![ChatMessage::user("Hello")]).with_max_tokens(1);
        match self.call_api(&probe).await {
            Ok(_) => {
                debug!("claude provider initialized");
                self.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("claude provider failed to initialize: {e}");
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
        let body = self.request_body(request, true);
        let url = format!("{}/v1/messages", self.base_url().trim_end_matches('/'));
        let client = self.client.clone();
        let api_key = self.config.api_key.clone();
        let timeout_secs = self.config.timeout_secs;
        let request_id = request.id.clone();

        Box::pin(stream! {
            let sent = timeout(
                Duration::from_secs(timeout_secs),
                client
                    .post(&url)
                    .header("x-api-key", &api_key)
                    .header("anthropic-version", API_VERSION)
                    .json(&body)
                    .send(),
            )
            .await;

            let response = match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    yield StreamChunk::terminal_error(&request_id, format!("network error: {e}"));
                    return;
                }
                Err(_) => {
                    yield StreamChunk::terminal_error(&request_id, "request timed out");
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                yield StreamChunk::terminal_error(
                    &request_id,
                    map_http_error(PROVIDER, status, &text).to_string(),
                );
                return;
            }

            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            let mut finished = false;

            while let Some(item) = bytes.next().await {
                let chunk_bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        yield StreamChunk::terminal_error(
                            &request_id,
                            format!("stream error: {e}"),
                        );
                        return;
                    }
                };

                for payload in parser.push_bytes(&chunk_bytes) {
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    match value["type"].as_str() {
                        Some("content_block_delta") => {
                            if let Some(text) = value["delta"]["text"].as_str() {
                                yield StreamChunk::part(&request_id, text);
                            }
                        }
                        Some("message_delta") => {
                            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                                let mut chunk = StreamChunk::part(&request_id, "");
                                chunk.finish_reason = Some(reason.to_string());
                                yield chunk;
                            }
                        }
                        Some("message_stop") => {
                            yield StreamChunk::terminal(&request_id);
                            finished = true;
                        }
                        Some("error") => {
                            let message = value["error"]["message"]
                                .as_str()
                                .unwrap_or("stream error");
                            yield StreamChunk::terminal_error(&request_id, message);
                            return;
                        }
                        _ => {}
                    }
                    if finished {
                        break;
                    }
                }
                if finished {
                    break;
                }
            }

            if !finished {
                yield StreamChunk::terminal(&request_id);
            }
        })
    }

    fn estimate_cost(&self, request: &LlmRequest) -> f64 {
        let input_tokens: f64 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let (input_rate, output_rate) = self.rates_for(&self.model_for(request));
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);
        input_tokens * input_rate + max_tokens as f64 * output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_provider(base_url: &str) -> ClaudeProvider {
        let config = ProviderConfig::new("claude", "ck-test", "claude-3-5-sonnet-20241022")
            .with_base_url(base_url);
        ClaudeProvider::new(config).unwrap()
    }

    fn request() -> LlmRequest {
        LlmRequest::new(vec![
            ChatMessage::system("Answer in one word."),
            ChatMessage::user("Capital of France?"),
        ])
    }

    #[tokio::test]
    async fn generate_parses_messages_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ck-test"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Paris"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 20, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let response = provider.generate(&request()).await;

        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.content, "Paris");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));

        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 21);
        // 20 * 0.000015 + 1 * 0.000075 for sonnet
        assert!((usage.estimated_cost - 0.000_375).abs() < 1e-12);
    }

    #[tokio::test]
    async fn stream_generate_handles_delta_events() {
        let sse_body = concat!(
            "data: {\"type\":\"message_start\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Pa\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"ris\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let mut stream = provider.stream_generate(&request()).await;

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Paris");
        assert!(chunks.last().unwrap().is_final);
        assert!(chunks
            .iter()
            .any(|c| c.finish_reason.as_deref() == Some("end_turn")));
    }

    #[test]
    fn system_messages_are_lifted_out() {
        let (system, chat) = ClaudeProvider::split_messages(&[
            ChatMessage::system("one"),
            ChatMessage::user("hi"),
            ChatMessage::system("two"),
        ]);
        assert_eq!(system.as_deref(), Some("one\ntwo"));
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0]["role"], "user");
    }

    #[test]
    fn rates_match_on_family_substring() {
        let provider = test_provider("http://localhost:1");
        assert_eq!(
            provider.rates_for("claude-3-haiku-20240307"),
            (0.000_000_25, 0.000_001_25)
        );
        assert_eq!(
            provider.rates_for("claude-unknown-model"),
            (0.000_015, 0.000_075)
        );
    }
}
