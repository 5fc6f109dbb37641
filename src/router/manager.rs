//! Routing and fallback across registered providers.
//!
//! The manager owns the provider registry, decides candidate order (static
//! fallback order or the load-balance score), applies admission control and
//! the circuit breaker, and walks candidates until one succeeds. Callers see
//! one response per request regardless of how many providers were tried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::stats::{ProviderStats, StatsSnapshot, DEFAULT_LATENCY_MS};
use crate::config::{LlmConfig, ProviderConfig, RoutingTuning};
use crate::error::RouterError;
use crate::providers::{build_provider, LlmProvider};
use crate::types::{ChunkStream, LlmRequest, LlmResponse, StreamChunk};

/// Sentinel provider name on responses when no provider was admissible.
const PROVIDER_NONE: &str = "none";

/// Sentinel provider name on responses when every candidate failed.
const PROVIDER_FAILED: &str = "failed";

/// One provider as the manager sees it: its static configuration, the live
/// adapter, and its mutable stats.
#[derive(Clone)]
pub(crate) struct RegisteredProvider {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn LlmProvider>,
    pub stats: Arc<Mutex<ProviderStats>>,
}

pub struct LlmManager {
    config: LlmConfig,
    providers: RwLock<HashMap<String, RegisteredProvider>>,
    initialized: AtomicBool,
    init_lock: AsyncMutex<()>,
    concurrency: Arc<Semaphore>,
}

impl LlmManager {
    pub fn new(config: LlmConfig) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            config,
            providers: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            init_lock: AsyncMutex::new(()),
            concurrency,
        }
    }

    /// Build a manager from environment-variable configuration.
    pub fn from_env() -> Self {
        Self::new(LlmConfig::from_env())
    }

    /// Build adapters for every enabled provider and probe connectivity.
    ///
    /// A provider that fails its probe is logged and left out of the
    /// registry; it can be re-added later via
    /// [`add_provider`](Self::add_provider). Errors only when no provider
    /// is registered at all.
    pub async fn initialize(&self) -> Result<(), RouterError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        for (name, provider_config) in self.config.enabled_providers() {
            {
                let registry = self.providers.read().await;
                if registry.contains_key(name) {
                    continue;
                }
            }

            let adapter = match build_provider(provider_config) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(provider = %name, error = %e, "skipping provider, construction failed");
                    continue;
                }
            };

            if !adapter.initialize().await {
                warn!(provider = %name, "provider failed connectivity probe, skipping");
                continue;
            }
            info!(provider = %name, "provider initialized");

            let entry = RegisteredProvider {
                config: provider_config.clone(),
                adapter,
                stats: Arc::new(Mutex::new(ProviderStats::new())),
            };
            self.providers.write().await.entry(name.clone()).or_insert(entry);
        }

        let registry = self.providers.read().await;
        if registry.is_empty() {
            return Err(RouterError::NoProvidersAvailable);
        }
        info!(providers = registry.len(), "manager initialized");
        drop(registry);

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<(), RouterError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize().await
    }

    /// Register a pre-built adapter directly, bypassing construction and the
    /// connectivity probe. Intended for embedding custom adapter
    /// implementations.
    pub async fn register_adapter(&self, config: ProviderConfig, adapter: Arc<dyn LlmProvider>) {
        let name = config.name.clone();
        let entry = RegisteredProvider {
            config,
            adapter,
            stats: Arc::new(Mutex::new(ProviderStats::new())),
        };
        self.providers.write().await.insert(name, entry);
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Register and initialize one more provider at runtime. Fails when the
    /// connectivity probe does, leaving the registry untouched.
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<(), RouterError> {
        let adapter =
            build_provider(&config).map_err(|e| RouterError::Registration(e.to_string()))?;
        if !adapter.initialize().await {
            return Err(RouterError::Registration(format!(
                "{} failed connectivity probe",
                config.name
            )));
        }
        self.register_adapter(config, adapter).await;
        Ok(())
    }

    pub async fn remove_provider(&self, name: &str) -> bool {
        self.providers.write().await.remove(name).is_some()
    }

    /// Drop all registered providers.
    pub async fn shutdown(&self) {
        self.providers.write().await.clear();
        self.initialized.store(false, Ordering::SeqCst);
        info!("manager shut down");
    }

    /// Generate a response, falling back across providers until one
    /// succeeds. Never errors at the call boundary: failures come back as a
    /// response with `error` set.
    pub async fn generate(&self, request: &LlmRequest) -> LlmResponse {
        self.generate_with_provider(request, None).await
    }

    /// Like [`generate`](Self::generate), but tries `preferred` first when
    /// it is registered and admissible.
    pub async fn generate_with_provider(
        &self,
        request: &LlmRequest,
        preferred: Option<&str>,
    ) -> LlmResponse {
        if let Err(reason) = request.validate() {
            return LlmResponse::failure(&request.id, PROVIDER_NONE, reason);
        }
        if let Err(e) = self.ensure_initialized().await {
            return LlmResponse::failure(&request.id, PROVIDER_NONE, e.to_string());
        }
        let request = &self.apply_defaults(request);

        // A closed semaphore cannot happen here; ok() avoids poisoning the
        // response path regardless.
        let _permit = self.concurrency.clone().acquire_owned().await.ok();

        let candidates = self.candidates(preferred).await;
        let mut attempted = false;
        let mut last_error = String::new();

        for (name, entry) in candidates {
            if !Self::admissible_entry(&self.config.tuning, &entry) {
                debug!(provider = %name, "provider not admissible, skipping");
                continue;
            }
            attempted = true;

            debug!(provider = %name, request_id = %request.id, "attempting provider");
            let start = Instant::now();
            let response = entry.adapter.generate(request).await;
            let latency_ms = elapsed_ms(start);
            let cost = response
                .usage
                .as_ref()
                .map(|u| u.estimated_cost)
                .unwrap_or(0.0);

            match &response.error {
                None => {
                    entry.stats.lock().record_request(true, latency_ms, cost);
                    debug!(provider = %name, latency_ms, "request served");
                    return response;
                }
                Some(error) => {
                    entry.stats.lock().record_request(false, latency_ms, 0.0);
                    warn!(provider = %name, error = %error, "provider failed, falling back");
                    last_error = format!("{name}: {error}");
                }
            }
        }

        if !attempted {
            LlmResponse::failure(
                &request.id,
                PROVIDER_NONE,
                RouterError::NoProvidersAvailable.to_string(),
            )
        } else {
            LlmResponse::failure(
                &request.id,
                PROVIDER_FAILED,
                RouterError::AllProvidersFailed { last_error }.to_string(),
            )
        }
    }

    /// Streaming counterpart of [`generate`](Self::generate).
    ///
    /// A provider that dies before yielding any content is treated as a
    /// failed attempt and the next candidate is tried. Once content has been
    /// forwarded, failover is no longer possible; a mid-stream death
    /// surfaces as a terminal error chunk.
    pub async fn stream_generate(&self, request: &LlmRequest) -> ChunkStream {
        self.stream_generate_with_provider(request, None).await
    }

    pub async fn stream_generate_with_provider(
        &self,
        request: &LlmRequest,
        preferred: Option<&str>,
    ) -> ChunkStream {
        let request_id = request.id.clone();

        if let Err(reason) = request.validate() {
            return Box::pin(stream! {
                yield StreamChunk::terminal_error(&request_id, reason);
            });
        }
        if let Err(e) = self.ensure_initialized().await {
            let message = e.to_string();
            return Box::pin(stream! {
                yield StreamChunk::terminal_error(&request_id, message);
            });
        }

        let candidates = self.candidates(preferred).await;
        let tuning = self.config.tuning.clone();
        let semaphore = Arc::clone(&self.concurrency);
        let request = self.apply_defaults(request);

        Box::pin(stream! {
            let _permit = semaphore.acquire_owned().await.ok();

            let mut attempted = false;
            let mut last_error = String::new();

            'providers: for (name, entry) in candidates {
                if !Self::admissible_entry(&tuning, &entry) {
                    debug!(provider = %name, "provider not admissible, skipping");
                    continue;
                }
                attempted = true;

                let start = Instant::now();
                let mut inner = entry.adapter.stream_generate(&request).await;
                let mut yielded_content = false;

                while let Some(chunk) = inner.next().await {
                    if chunk.is_final {
                        if let Some(error) = chunk.error() {
                            entry
                                .stats
                                .lock()
                                .record_request(false, elapsed_ms(start), 0.0);
                            last_error = format!("{name}: {error}");
                            if yielded_content {
                                // Content already went out; restarting on
                                // another provider would duplicate it.
                                warn!(provider = %name, error = %error, "stream died mid-flight");
                                yield chunk;
                                return;
                            }
                            warn!(provider = %name, error = %error, "stream failed before content, falling back");
                            continue 'providers;
                        }

                        entry
                            .stats
                            .lock()
                            .record_request(true, elapsed_ms(start), 0.0);
                        debug!(provider = %name, "stream completed");
                        yield chunk;
                        return;
                    }

                    if !chunk.content.is_empty() {
                        yielded_content = true;
                    }
                    yield chunk;
                }

                // Stream ended without a terminal chunk.
                entry
                    .stats
                    .lock()
                    .record_request(false, elapsed_ms(start), 0.0);
                last_error = format!("{name}: stream ended unexpectedly");
                if yielded_content {
                    yield StreamChunk::terminal_error(&request.id, "stream ended unexpectedly");
                    return;
                }
            }

            let message = if !attempted {
                RouterError::NoProvidersAvailable.to_string()
            } else {
                RouterError::AllProvidersFailed { last_error }.to_string()
            };
            yield StreamChunk::terminal_error(&request.id, message);
        })
    }

    /// Candidate providers in attempt order, preferred first when set.
    async fn candidates(&self, preferred: Option<&str>) -> Vec<(String, RegisteredProvider)> {
        let registry = self.providers.read().await;
        let mut order = if self.config.load_balancing {
            self.load_balanced_order(&registry)
        } else {
            self.fallback_order(&registry)
        };

        if let Some(preferred) = preferred {
            if registry.contains_key(preferred) {
                order.retain(|name| name != preferred);
                order.insert(0, preferred.to_string());
            }
        }

        order
            .into_iter()
            .filter_map(|name| registry.get(&name).map(|entry| (name.clone(), entry.clone())))
            .collect()
    }

    /// Providers sorted by descending health score, random tiebreak.
    fn load_balanced_order(&self, registry: &HashMap<String, RegisteredProvider>) -> Vec<String> {
        let tuning = &self.config.tuning;
        let mut scored: Vec<(f64, f64, String)> = registry
            .iter()
            .map(|(name, entry)| {
                let mut stats = entry.stats.lock();
                let latency = if stats.successes == 0 {
                    DEFAULT_LATENCY_MS
                } else {
                    stats.avg_latency_ms()
                };
                let utilization =
                    stats.current_rate() as f64 / entry.config.rate_limit.max(1) as f64;
                let score = stats.success_rate() * tuning.success_weight
                    - latency / tuning.latency_divisor
                    - utilization * tuning.rate_weight;
                (score, rand::random::<f64>(), name.clone())
            })
            .collect();

        scored.sort_by(|a, b| {
            (b.0, b.1)
                .partial_cmp(&(a.0, a.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.into_iter().map(|(_, _, name)| name).collect()
    }

    /// Configured fallback order, with unlisted providers appended by
    /// priority.
    fn fallback_order(&self, registry: &HashMap<String, RegisteredProvider>) -> Vec<String> {
        let mut order: Vec<String> = self
            .config
            .fallback_order
            .iter()
            .filter(|name| registry.contains_key(*name))
            .cloned()
            .collect();

        let mut remaining: Vec<&String> =
            registry.keys().filter(|name| !order.contains(name)).collect();
        remaining.sort_by_key(|name| {
            (
                registry.get(*name).map(|e| e.config.priority).unwrap_or(u32::MAX),
                (*name).clone(),
            )
        });
        order.extend(remaining.into_iter().cloned());
        order
    }

    /// Admission control plus circuit breaker for one candidate.
    fn admissible_entry(tuning: &RoutingTuning, entry: &RegisteredProvider) -> bool {
        let mut stats = entry.stats.lock();

        if stats.current_rate() >= entry.config.rate_limit {
            return false;
        }
        if let Some(limit) = entry.config.cost_limit_per_day {
            if stats.daily_cost >= limit {
                return false;
            }
        }
        // Breaker engages only once enough history exists to judge.
        if stats.requests > tuning.breaker_min_requests
            && stats.success_rate() < tuning.breaker_success_floor
        {
            return false;
        }
        true
    }

    /// Fill in manager-level defaults for fields the caller left unset.
    fn apply_defaults(&self, request: &LlmRequest) -> LlmRequest {
        let mut request = request.clone();
        request.max_tokens.get_or_insert(self.config.default_max_tokens);
        request
            .temperature
            .get_or_insert(self.config.default_temperature);
        request
    }

    /// Pre-flight cost estimate. Delegates to `provider` when named, else
    /// to the provider the router would try first; 0.0 with an empty
    /// registry. An approximation: the request may still be served by a
    /// later candidate.
    pub async fn estimate_cost(&self, request: &LlmRequest, provider: Option<&str>) -> f64 {
        let request = self.apply_defaults(request);

        if let Some(name) = provider {
            let registry = self.providers.read().await;
            if let Some(entry) = registry.get(name) {
                return entry.adapter.estimate_cost(&request);
            }
        }

        self.candidates(None)
            .await
            .first()
            .map(|(_, entry)| entry.adapter.estimate_cost(&request))
            .unwrap_or(0.0)
    }

    /// Pre-flight cost estimate for every registered provider.
    pub async fn estimate_costs(&self, request: &LlmRequest) -> HashMap<String, f64> {
        let request = self.apply_defaults(request);
        let registry = self.providers.read().await;
        registry
            .iter()
            .map(|(name, entry)| (name.clone(), entry.adapter.estimate_cost(&request)))
            .collect()
    }

    /// Probe every registered provider with a minimal generation.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let registry = self.providers.read().await;
        let entries: Vec<(String, Arc<dyn LlmProvider>)> = registry
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.adapter)))
            .collect();
        drop(registry);

        let mut results = HashMap::new();
        for (name, adapter) in entries {
            results.insert(name, adapter.health_check().await);
        }
        results
    }

    /// Stats snapshot per registered provider.
    pub async fn get_stats(&self) -> HashMap<String, StatsSnapshot> {
        let registry = self.providers.read().await;
        registry
            .iter()
            .map(|(name, entry)| {
                let available = entry.adapter.is_available();
                (name.clone(), entry.stats.lock().snapshot(available))
            })
            .collect()
    }

    /// Names of providers currently reporting themselves available.
    pub async fn get_available_providers(&self) -> Vec<String> {
        let registry = self.providers.read().await;
        let mut names: Vec<String> = registry
            .iter()
            .filter(|(_, entry)| entry.adapter.is_available())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Candidate order the router would use right now. Exposed for
    /// diagnostics.
    pub async fn provider_order(&self, preferred: Option<&str>) -> Vec<String> {
        self.candidates(preferred)
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn registered(&self, name: &str) -> Option<RegisteredProvider> {
        self.providers.read().await.get(name).cloned()
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
