//! OpenAI-compatible ("GPT-like") provider adapter.
//!
//! Talks to `/v1/chat/completions` with Bearer auth and native SSE
//! streaming. Any endpoint speaking the same dialect can be targeted via
//! `base_url`.

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
use crate::types::{ChatMessage, ChunkStream, LlmRequest, LlmResponse, StreamChunk, Usage};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const FALLBACK_RATE_MODEL: &str = "gpt-4";

pub struct OpenAiProvider {
    config: ProviderConfig,
    client: Client,
    retry: RetryPolicy,
    /// (input $/token, output $/token) keyed by model.
    rates: HashMap<&'static str, (f64, f64)>,
    available: AtomicBool,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_http_client(config.timeout_secs)?;
        let retry = RetryPolicy::new(RetryConfig::with_attempts(config.retry_attempts));

        let mut rates = HashMap::new();
        rates.insert("gpt-4", (0.000_03, 0.000_06));
        rates.insert("gpt-4-turbo", (0.000_01, 0.000_03));
        rates.insert("gpt-3.5-turbo", (0.000_001, 0.000_002));

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

    fn rates_for(&self, model: &str) -> (f64, f64) {
        self.rates
            .get(model)
            .or_else(|| self.rates.get(self.config.default_model.as_str()))
            .or_else(|| self.rates.get(FALLBACK_RATE_MODEL))
            .copied()
            .unwrap_or((0.0, 0.0))
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model_for(request),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "stream": stream,
        });
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<Value, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url().trim_end_matches('/')
        );

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client
                .post(&url)
                .bearer_auth(&self.config.api_key)
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

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::response_parsing(PROVIDER, "missing message content"))?
            .to_string();
        let finish_reason = value["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);

        let prompt_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
        let total_tokens = value["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or((prompt_tokens + completion_tokens) as u64) as u32;
        let (input_rate, output_rate) = self.rates_for(&model);

        Ok(LlmResponse {
            request_id: request.id.clone(),
            content,
            finish_reason,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
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
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn initialize(&self) -> bool {
        let probe = LlmRequest::new(vec![ChatMessage::user("Hello")]).with_max_tokens(1);
        match self.call_api(&probe).await {
            Ok(_) => {
                debug!("openai provider initialized");
                self.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("openai provider failed to initialize: {e}");
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
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url().trim_end_matches('/')
        );
        let client = self.client.clone();
        let api_key = self.config.api_key.clone();
        let timeout_secs = self.config.timeout_secs;
        let request_id = request.id.clone();

        Box::pin(stream! {
            let sent = timeout(
                Duration::from_secs(timeout_secs),
                client.post(&url).bearer_auth(&api_key).json(&body).send(),
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
                    if payload == "[DONE]" {
                        yield StreamChunk::terminal(&request_id);
                        finished = true;
                        break;
                    }
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let delta = value["choices"][0]["delta"]["content"]
                        .as_str()
                        .unwrap_or("");
                    let finish_reason = value["choices"][0]["finish_reason"]
                        .as_str()
                        .map(str::to_string);
                    if !delta.is_empty() || finish_reason.is_some() {
                        let mut chunk = StreamChunk::part(&request_id, delta);
                        chunk.finish_reason = finish_reason;
                        yield chunk;
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
