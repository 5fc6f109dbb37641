//! Custom HTTP provider adapter for self-hosted or internal gateways.
//!
//! Speaks the OpenAI chat-completions dialect, since that is what most
//! self-hosted inference servers expose, but the endpoint path and auth
//! header are configurable. Cost is always zero: self-hosted capacity is
//! not billed per token. Streaming is simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    build_http_client, chunk_words, map_http_error, LlmProvider, RetryConfig, RetryPolicy,
    DEFAULT_TEMPERATURE, SIMULATED_CHUNK_WORDS,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, ChunkStream, LlmRequest, LlmResponse, StreamChunk, Usage};

const PROVIDER: &str = "custom";
const DEFAULT_ENDPOINT: &str = "/v1/chat/completions";

pub struct CustomProvider {
    config: ProviderConfig,
    base_url: String,
    client: Client,
    retry: RetryPolicy,
    available: AtomicBool,
}

impl CustomProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        // Unlike the hosted adapters there is no well-known default host.
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ProviderError::configuration(PROVIDER, "base_url is required"))?;
        let client = build_http_client(config.timeout_secs)?;
        let retry = RetryPolicy::new(RetryConfig::with_attempts(config.retry_attempts));
        Ok(Self {
            config,
            base_url,
            client,
            retry,
            available: AtomicBool::new(false),
        })
    }

    fn url(&self) -> String {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT);
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn auth_header(&self) -> (String, String) {
        let name = self
            .config
            .auth_header
            .clone()
            .unwrap_or_else(|| "Authorization".to_string());
        let prefix = self.config.auth_prefix.as_deref().unwrap_or("Bearer ");
        (name, format!("{prefix}{}", self.config.api_key))
    }

    fn model_for(&self, request: &LlmRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        json!({
            "model": self.model_for(request),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "stream": false,
        })
    }

    async fn call_api(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let (header_name, header_value) = self.auth_header();
        let body = self.request_body(request);

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client
                .post(self.url())
                .header(header_name, header_value)
                .json(&body)
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

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::response_parsing(PROVIDER, e.to_string()))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::response_parsing(PROVIDER, "missing message content"))?
            .to_string();
        let finish_reason = value["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);

        let prompt_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(LlmResponse {
            request_id: request.id.clone(),
            content,
            finish_reason,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                estimated_cost: 0.0,
            }),
            model: Some(self.model_for(request)),
            provider: PROVIDER.to_string(),
            latency_ms: 0.0,
            error: None,
        })
    }
}

#[async_trait]
impl LlmProvider for CustomProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn initialize(&self) -> bool {
        let probe = LlmRequest::new(vec![ChatMessage::user("Hello")]).with_max_tokens(1);
        match self.call_api(&probe).await {
            Ok(_) => {
                debug!("custom provider initialized at {}", self.base_url);
                self.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("custom provider failed to initialize: {e}");
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

    // Self-hosted capacity is not billed per request.
    fn estimate_cost(&self, _request: &LlmRequest) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion_body(text: &str) -> Value {
        json!({
            "choices": [{
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3}
        })
    }

    #[test]
    fn missing_base_url_is_a_configuration_error() {
        let config = ProviderConfig::new("custom", "key", "local-model");
        let result = CustomProvider::new(config);
        assert!(matches!(
            result,
            Err(ProviderError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn default_endpoint_and_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer local-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let config = ProviderConfig::new("custom", "local-key", "local-model")
            .with_base_url(&server.uri());
        let provider = CustomProvider::new(config).unwrap();
        let response = provider
            .generate(&LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;

        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.content, "ok");
        assert_eq!(response.usage.unwrap().estimated_cost, 0.0);
    }

    #[tokio::test]
    async fn custom_auth_header_and_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(header("x-gateway-token", "tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("yes")))
            .mount(&server)
            .await;

        let mut config = ProviderConfig::new("custom", "tok-123", "local-model")
            .with_base_url(&server.uri());
        config.endpoint = Some("/api/generate".to_string());
        config.auth_header = Some("x-gateway-token".to_string());
        config.auth_prefix = Some("".to_string());

        let provider = CustomProvider::new(config).unwrap();
        let response = provider
            .generate(&LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;
        assert_eq!(response.content, "yes");
    }

    #[tokio::test]
    async fn simulated_stream_marks_last_content_chunk_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("alpha beta gamma delta epsilon zeta")),
            )
            .mount(&server)
            .await;

        let config = ProviderConfig::new("custom", "k", "local-model")
            .with_base_url(&server.uri());
        let provider = CustomProvider::new(config).unwrap();
        let mut stream = provider
            .stream_generate(&LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        // 6 words in groups of 5; the last content chunk is the terminal.
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
        assert!(!chunks[1].content.is_empty());
        assert!(chunks[1].error().is_none());
    }

    #[test]
    fn cost_estimate_is_always_zero() {
        let config = ProviderConfig::new("custom", "k", "m").with_base_url("http://localhost:1");
        let provider = CustomProvider::new(config).unwrap();
        let request = LlmRequest::new(vec![ChatMessage::user("lots and lots of words here")]);
        assert_eq!(provider.estimate_cost(&request), 0.0);
    }
}
