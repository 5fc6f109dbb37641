//! Retry with exponential backoff for transient provider errors.
//!
//! This is the adapter-internal tier: a single provider is retried a bounded
//! number of times before the manager treats it as failed and falls over to
//! the next provider. The two tiers are deliberately separate.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute `f`, retrying transient failures with exponential backoff.
    /// Non-transient errors (auth, quota, parse, 4xx) return immediately.
    pub async fn call<F, Fut, R>(&self, mut f: F) -> Result<R, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, ProviderError>>,
    {
        let mut attempt = 0;
        let mut delay = self.config.base_delay;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("retry succeeded on attempt {attempt}");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_transient() || attempt >= self.config.max_attempts {
                        return Err(error);
                    }

                    debug!("attempt {attempt} failed: {error}, retrying in {delay:?}");

                    let actual_delay = if self.config.jitter {
                        let jitter =
                            delay.as_millis() as f64 * 0.1 * (rand::random::<f64>() - 0.5);
                        Duration::from_millis((delay.as_millis() as f64 + jitter) as u64)
                    } else {
                        delay
                    };
                    tokio::time::sleep(actual_delay).await;

                    delay = std::cmp::min(
                        Duration::from_millis(
                            (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                        ),
                        self.config.max_delay,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);

        let result = policy
            .call(|| async {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(ProviderError::network("test", "flaky"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(5);

        let result: Result<(), _> = policy
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::authentication("test", "bad key"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);

        let result: Result<(), _> = policy
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::timeout("test", "slow"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
