//! Normalized generation request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Role tag for a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Immutable generation request.
///
/// The `id` is generated at creation and stays stable across retries and
/// provider fallbacks, so every attempt for one logical request can be
/// correlated in logs and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    /// Overrides the provider's default model when set.
    pub model: Option<String>,
    /// Unset fields inherit the manager's configured defaults; adapters
    /// called standalone fall back to their provider config.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub metadata: HashMap<String, Value>,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
            model: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// A generation call requires at least one message.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("request contains no messages".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = LlmRequest::new(vec![ChatMessage::user("hi")]);
        let b = LlmRequest::new(vec![ChatMessage::user("hi")]);
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn empty_requests_fail_validation() {
        let request = LlmRequest::new(vec![]);
        assert!(request.validate().is_err());

        let request = LlmRequest::new(vec![ChatMessage::user("hello")]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn builder_overrides_defaults() {
        let request = LlmRequest::new(vec![ChatMessage::user("hi")])
            .with_model("gpt-4-turbo")
            .with_max_tokens(128)
            .with_temperature(0.1)
            .with_top_p(0.9)
            .streaming();

        assert_eq!(request.model.as_deref(), Some("gpt-4-turbo"));
        assert_eq!(request.max_tokens, Some(128));
        assert_eq!(request.temperature, Some(0.1));
        assert_eq!(request.top_p, Some(0.9));
        assert!(request.stream);
    }

    #[test]
    fn generation_knobs_start_unset() {
        let request = LlmRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(request.max_tokens, None);
        assert_eq!(request.temperature, None);
    }

    #[test]
    fn role_serialization_is_lowercase() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
