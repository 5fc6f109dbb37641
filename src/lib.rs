//! # llmux
//!
//! Multi-provider LLM routing with automatic fallback.
//!
//! llmux fronts several hosted LLM APIs (OpenAI, Gemini, Claude, and
//! OpenAI-compatible custom endpoints) behind one request/response model.
//! The manager picks a provider per request from live health stats, applies
//! per-provider rate and budget admission control, and falls back through
//! the remaining candidates when a provider fails. Callers always get one
//! answer per request; provider churn stays internal.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use llmux::{ChatMessage, LlmManager, LlmRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Reads OPENAI_API_KEY, GEMINI_API_KEY, ANTHROPIC_API_KEY,
//!     // CUSTOM_LLM_BASE_URL/CUSTOM_LLM_API_KEY from the environment.
//!     let manager = LlmManager::from_env();
//!
//!     let request = LlmRequest::new(vec![
//!         ChatMessage::system("You are a helpful assistant."),
//!         ChatMessage::user("What is the capital of France?"),
//!     ]);
//!
//!     let response = manager.generate(&request).await;
//!     match response.error {
//!         None => println!("[{}] {}", response.provider, response.content),
//!         Some(error) => eprintln!("request failed: {error}"),
//!     }
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use llmux::{ChatMessage, LlmManager, LlmRequest};
//!
//! # async fn demo(manager: LlmManager) {
//! let request = LlmRequest::new(vec![ChatMessage::user("Tell me a story")]).streaming();
//! let mut stream = manager.stream_generate(&request).await;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk.content);
//!     if chunk.is_final {
//!         if let Some(error) = chunk.error() {
//!             eprintln!("\nstream aborted: {error}");
//!         }
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod providers;
pub mod router;
pub mod types;

pub use config::{LlmConfig, ProviderConfig, RoutingTuning};
pub use error::{ConfigError, ProviderError, RouterError};
pub use providers::{build_provider, LlmProvider};
pub use router::{LlmManager, ProviderStats, StatsSnapshot};
pub use types::{
    ChatMessage, ChunkStream, LlmRequest, LlmResponse, MessageRole, StreamChunk, Usage,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
