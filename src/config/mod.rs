//! Declarative configuration for providers and routing.
//!
//! Providers are parameterized entirely through [`ProviderConfig`]; the
//! manager-wide knobs (load balancing, fallback order, concurrency cap, and
//! the tunable routing constants) live on [`LlmConfig`]. Configuration can be
//! built programmatically, loaded from environment variables, or read from a
//! JSON file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_rate_limit() -> u32 {
    60
}

fn default_priority() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    10
}

fn default_temperature() -> f32 {
    0.7
}

/// Static configuration for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name; also selects the adapter type
    /// (`openai`, `gemini`, `claude`, `custom`).
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub default_model: String,
    /// Catalog of models this provider serves.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Requests per minute admitted before the provider is skipped.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Lower priority is tried first when load balancing is disabled.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Daily spend ceiling in USD; unlimited when absent.
    #[serde(default)]
    pub cost_limit_per_day: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Adapter-internal retry budget for transient errors.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    // Custom-endpoint knobs; ignored by the built-in adapters.
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub auth_prefix: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            api_key: api_key.into(),
            base_url: None,
            default_model: default_model.into(),
            models: Vec::new(),
            max_tokens: default_max_tokens(),
            rate_limit: default_rate_limit(),
            priority: default_priority(),
            cost_limit_per_day: None,
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            auth_header: None,
            auth_prefix: None,
            endpoint: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cost_limit_per_day(mut self, limit: f64) -> Self {
        self.cost_limit_per_day = Some(limit);
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}

/// Tunable constants in the routing heuristics.
///
/// The defaults reproduce the historically observed behavior; none of them
/// are derived from first principles, so they are exposed for tuning rather
/// than hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTuning {
    /// Weight of the success rate in the load-balance score.
    pub success_weight: f64,
    /// Average latency (ms) is divided by this before subtraction.
    pub latency_divisor: f64,
    /// Weight of the rate-limit utilization in the load-balance score.
    pub rate_weight: f64,
    /// Circuit breaker only engages after this many total requests.
    pub breaker_min_requests: u64,
    /// Success rate below this floor trips the circuit breaker.
    pub breaker_success_floor: f64,
}

impl Default for RoutingTuning {
    fn default() -> Self {
        Self {
            success_weight: 100.0,
            latency_divisor: 10.0,
            rate_weight: 50.0,
            breaker_min_requests: 10,
            breaker_success_floor: 0.1,
        }
    }
}

/// Manager-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Order in which providers are tried when load balancing is off.
    /// Registered providers missing from the list are appended by priority.
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default = "default_true")]
    pub load_balancing: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub tuning: RoutingTuning,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            fallback_order: Vec::new(),
            load_balancing: true,
            max_concurrent_requests: default_max_concurrent(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            tuning: RoutingTuning::default(),
        }
    }
}

impl LlmConfig {
    /// Build a configuration from environment variables.
    ///
    /// One credential variable per provider family; a provider whose
    /// credential is absent is never registered. `.env` files are honored.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            let mut provider = ProviderConfig::new(
                "openai",
                api_key,
                env::var("OPENAI_DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4".to_string()),
            )
            .with_models(vec![
                "gpt-4".to_string(),
                "gpt-4-turbo".to_string(),
                "gpt-3.5-turbo".to_string(),
            ])
            .with_priority(1);
            provider.base_url = env::var("OPENAI_BASE_URL").ok();
            config.providers.insert("openai".to_string(), provider);
        }

        if let Ok(api_key) = env::var("GEMINI_API_KEY") {
            let provider = ProviderConfig::new(
                "gemini",
                api_key,
                env::var("GEMINI_DEFAULT_MODEL").unwrap_or_else(|_| "gemini-pro".to_string()),
            )
            .with_models(vec![
                "gemini-pro".to_string(),
                "gemini-pro-vision".to_string(),
            ])
            .with_priority(2);
            config.providers.insert("gemini".to_string(), provider);
        }

        if let Ok(api_key) = env::var("ANTHROPIC_API_KEY") {
            let provider = ProviderConfig::new(
                "claude",
                api_key,
                env::var("CLAUDE_DEFAULT_MODEL")
                    .unwrap_or_else(|_| "claude-3-sonnet-20240229".to_string()),
            )
            .with_models(vec![
                "claude-3-sonnet-20240229".to_string(),
                "claude-3-haiku-20240307".to_string(),
            ])
            .with_priority(3);
            config.providers.insert("claude".to_string(), provider);
        }

        if let (Ok(base_url), Ok(api_key)) = (
            env::var("CUSTOM_LLM_BASE_URL"),
            env::var("CUSTOM_LLM_API_KEY"),
        ) {
            let provider = ProviderConfig::new(
                "custom",
                api_key,
                env::var("CUSTOM_LLM_MODEL").unwrap_or_else(|_| "custom-model".to_string()),
            )
            .with_base_url(base_url)
            .with_priority(4);
            config.providers.insert("custom".to_string(), provider);
        }

        config.fallback_order = config.providers_by_priority();
        config
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Persist the configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Enabled providers only.
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, p)| p.enabled)
    }

    /// Enabled provider names ordered by priority, then name for stability.
    pub fn providers_by_priority(&self) -> Vec<String> {
        let mut names: Vec<&String> = self.enabled_providers().map(|(name, _)| name).collect();
        names.sort_by_key(|name| {
            (
                self.providers.get(*name).map(|p| p.priority).unwrap_or(u32::MAX),
                (*name).clone(),
            )
        });
        names.into_iter().cloned().collect()
    }

    pub fn add_provider(&mut self, provider: ProviderConfig) {
        let name = provider.name.clone();
        self.providers.insert(name.clone(), provider);
        if !self.fallback_order.contains(&name) {
            self.fallback_order.push(name);
        }
    }

    pub fn remove_provider(&mut self, name: &str) {
        self.providers.remove(name);
        self.fallback_order.retain(|n| n != name);
    }

    pub fn provider_mut(&mut self, name: &str) -> Option<&mut ProviderConfig> {
        self.providers.get_mut(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_stable() {
        let mut config = LlmConfig::default();
        config.add_provider(ProviderConfig::new("gemini", "k", "gemini-pro").with_priority(2));
        config.add_provider(ProviderConfig::new("openai", "k", "gpt-4").with_priority(1));
        config.add_provider(ProviderConfig::new("claude", "k", "claude-3-sonnet-20240229").with_priority(2));

        assert_eq!(
            config.providers_by_priority(),
            vec!["openai", "claude", "gemini"]
        );
    }

    #[test]
    fn disabled_providers_are_excluded() {
        let mut config = LlmConfig::default();
        let mut provider = ProviderConfig::new("openai", "k", "gpt-4");
        provider.enabled = false;
        config.add_provider(provider);
        config.add_provider(ProviderConfig::new("claude", "k", "claude-3-sonnet-20240229"));

        assert_eq!(config.providers_by_priority(), vec!["claude"]);
    }

    #[test]
    fn remove_provider_clears_fallback_order() {
        let mut config = LlmConfig::default();
        config.add_provider(ProviderConfig::new("openai", "k", "gpt-4"));
        config.add_provider(ProviderConfig::new("claude", "k", "claude-3-sonnet-20240229"));
        assert_eq!(config.fallback_order.len(), 2);

        config.remove_provider("openai");
        assert!(!config.fallback_order.contains(&"openai".to_string()));
        assert!(config.providers.get("openai").is_none());
    }

    #[test]
    fn file_round_trip() {
        let mut config = LlmConfig::default();
        config.load_balancing = false;
        config.add_provider(
            ProviderConfig::new("openai", "sk-test", "gpt-4")
                .with_rate_limit(30)
                .with_cost_limit_per_day(25.0),
        );

        let file = tempfile::NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = LlmConfig::from_file(file.path()).unwrap();

        assert!(!loaded.load_balancing);
        let provider = loaded.providers.get("openai").unwrap();
        assert_eq!(provider.rate_limit, 30);
        assert_eq!(provider.cost_limit_per_day, Some(25.0));
        assert_eq!(provider.retry_attempts, 3);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{
            "providers": {
                "openai": {
                    "name": "openai",
                    "api_key": "sk-test",
                    "default_model": "gpt-4"
                }
            }
        }"#;
        let config: LlmConfig = serde_json::from_str(json).unwrap();
        assert!(config.load_balancing);
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.tuning.breaker_min_requests, 10);

        let provider = config.providers.get("openai").unwrap();
        assert!(provider.enabled);
        assert_eq!(provider.rate_limit, 60);
        assert_eq!(provider.timeout_secs, 30);
    }
}
