//! Per-provider health and usage accounting.
//!
//! One [`ProviderStats`] instance exists per registered provider, guarded by
//! a `parking_lot::Mutex`. All mutation happens through the manager while the
//! lock is held, with no await points inside the critical section, so every
//! update is observed as a single atomic transition.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::Serialize;

/// Sliding-window length for the requests-per-minute rate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Cap on retained request timestamps.
const RATE_WINDOW_CAP: usize = 100;

/// Fallback latency (ms) scored against providers with no completed requests.
pub(crate) const DEFAULT_LATENCY_MS: f64 = 1000.0;

/// Mutable counters for one provider.
#[derive(Debug)]
pub struct ProviderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Lifetime spend in USD.
    pub total_cost: f64,
    /// Sum of latencies across successful requests only.
    pub total_latency_ms: f64,
    /// Spend since `last_reset`.
    pub daily_cost: f64,
    pub last_reset: NaiveDate,
    /// Timestamps of recent requests, oldest first.
    recent: VecDeque<Instant>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            total_cost: 0.0,
            total_latency_ms: 0.0,
            daily_cost: 0.0,
            last_reset: Utc::now().date_naive(),
            recent: VecDeque::new(),
        }
    }
}

impl ProviderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed attempt. The day boundary is checked first so
    /// the new cost lands in the correct day's budget.
    pub fn record_request(&mut self, success: bool, latency_ms: f64, cost: f64) {
        let today = Utc::now().date_naive();
        if today != self.last_reset {
            self.daily_cost = 0.0;
            self.last_reset = today;
        }

        self.requests += 1;
        if success {
            self.successes += 1;
            self.total_latency_ms += latency_ms;
        } else {
            self.failures += 1;
        }
        self.total_cost += cost;
        self.daily_cost += cost;

        if self.recent.len() == RATE_WINDOW_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(Instant::now());
    }

    /// Fraction of requests that succeeded; optimistic 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }

    /// Mean latency over successful requests; 0 with no successes.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_latency_ms / self.successes as f64
        }
    }

    /// Requests in the last minute. Eviction is lazy: expired timestamps are
    /// dropped here rather than on a timer.
    pub fn current_rate(&mut self) -> u32 {
        let cutoff = Instant::now().checked_sub(RATE_WINDOW);
        if let Some(cutoff) = cutoff {
            while self.recent.front().is_some_and(|t| *t <= cutoff) {
                self.recent.pop_front();
            }
        }
        self.recent.len() as u32
    }

    pub fn snapshot(&mut self, available: bool) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests,
            successes: self.successes,
            failures: self.failures,
            success_rate: self.success_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            total_cost: self.total_cost,
            daily_cost: self.daily_cost,
            current_rate: self.current_rate(),
            available,
        }
    }
}

/// Read-only view of a provider's stats at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_cost: f64,
    pub daily_cost: f64,
    pub current_rate: u32,
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_optimistic() {
        let stats = ProviderStats::new();
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.avg_latency_ms(), 0.0);
    }

    #[test]
    fn counters_accumulate() {
        let mut stats = ProviderStats::new();
        stats.record_request(true, 100.0, 0.01);
        stats.record_request(true, 300.0, 0.02);
        stats.record_request(false, 0.0, 0.0);

        assert_eq!(stats.requests, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_latency_ms() - 200.0).abs() < 1e-9);
        assert!((stats.total_cost - 0.03).abs() < 1e-9);
        assert!((stats.daily_cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn failed_requests_do_not_skew_latency() {
        let mut stats = ProviderStats::new();
        stats.record_request(true, 100.0, 0.0);
        stats.record_request(false, 9999.0, 0.0);
        assert!((stats.avg_latency_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn daily_cost_resets_across_day_boundary() {
        let mut stats = ProviderStats::new();
        stats.daily_cost = 5.0;
        stats.last_reset = Utc::now().date_naive().pred_opt().unwrap();

        stats.record_request(true, 50.0, 1.0);

        assert!((stats.daily_cost - 1.0).abs() < 1e-9);
        assert_eq!(stats.last_reset, Utc::now().date_naive());
        // Lifetime total is unaffected by the reset.
        assert!((stats.total_cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_counts_recent_requests() {
        let mut stats = ProviderStats::new();
        for _ in 0..5 {
            stats.record_request(true, 10.0, 0.0);
        }
        assert_eq!(stats.current_rate(), 5);
    }

    #[test]
    fn rate_window_is_capped() {
        let mut stats = ProviderStats::new();
        for _ in 0..150 {
            stats.record_request(true, 10.0, 0.0);
        }
        assert_eq!(stats.current_rate() as usize, RATE_WINDOW_CAP);
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let mut stats = ProviderStats::new();
        stats.record_request(true, 40.0, 0.5);
        let snapshot = stats.snapshot(true);

        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.current_rate, 1);
        assert!(snapshot.available);
        assert!((snapshot.avg_latency_ms - 40.0).abs() < 1e-9);
    }
}
