//! Normalized request/response model shared by all provider adapters.

mod request;
mod response;

pub use request::{ChatMessage, LlmRequest, MessageRole};
pub use response::{ChunkStream, LlmResponse, StreamChunk, Usage};
