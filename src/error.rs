//! Error types for provider adapters and the routing manager.
//!
//! Adapters never let a `ProviderError` escape their boundary: every failure
//! is folded into an error [`LlmResponse`](crate::types::LlmResponse) or a
//! terminal [`StreamChunk`](crate::types::StreamChunk). The enum exists so
//! the retry tier and the HTTP mapping code can reason about failure classes
//! before that conversion happens.

use thiserror::Error;

/// Failure classes observed while talking to a single provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("authentication failed for {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("rate limit exceeded for {provider}")]
    RateLimit {
        provider: String,
        /// Seconds until the provider suggests retrying, when it says.
        retry_after: Option<u64>,
    },

    #[error("quota exceeded for {provider}: {message}")]
    QuotaExceeded { provider: String, message: String },

    #[error("timeout for {provider}: {message}")]
    Timeout { provider: String, message: String },

    #[error("network error for {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("unparseable response from {provider}: {message}")]
    ResponseParsing { provider: String, message: String },

    #[error("API error from {provider} (status {status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("configuration error for {provider}: {message}")]
    Configuration { provider: String, message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl ProviderError {
    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit(provider: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::RateLimit {
            provider: provider.into(),
            retry_after,
        }
    }

    pub fn quota_exceeded(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Timeout {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn response_parsing(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResponseParsing {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn api(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    pub fn configuration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether the adapter-internal retry tier should try again.
    ///
    /// Auth, quota, parse, and 4xx API errors will not heal on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimit { .. } => true,
            Self::Api { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Manager-level failures.
///
/// `NoProvidersAvailable` is the one condition callers must handle as a hard
/// error; everything else is folded into the returned response.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no providers available")]
    NoProvidersAvailable,

    #[error("all providers failed; last error: {last_error}")]
    AllProvidersFailed { last_error: String },

    #[error("provider registration failed: {0}")]
    Registration(String),
}

/// Configuration file load/save failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
