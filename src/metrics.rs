//! Per-backend usage metrics.
//!
//! Counters are monotonic for the process lifetime; only the rolling latency
//! average resets, every 24 hours, via an observed-time check on update (no
//! timer task). The registry is a concurrent map — one entry per backend,
//! updated under the entry's own lock so concurrent requests never race a
//! read-modify-write.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{unix_timestamp, TokenUsage};

/// Seconds between rolling-average resets.
const RESET_INTERVAL_SECS: f64 = 86_400.0;

/// Usage counters for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub stream_requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Accumulated direct cost reported by adapters (USD).
    pub cost: f64,
    /// Cumulative mean latency over successful, non-cached responses.
    pub avg_latency_ms: f64,
    pub last_reset_at: f64,
    /// Sample count behind `avg_latency_ms`; resets with it.
    #[serde(skip)]
    latency_samples: u64,
}

impl BackendMetrics {
    fn new() -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            timeouts: 0,
            cache_hits: 0,
            stream_requests: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            avg_latency_ms: 0.0,
            last_reset_at: unix_timestamp(),
            latency_samples: 0,
        }
    }

    /// Success percentage over terminal outcomes, 0–100.
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        (self.successes as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
    }

    /// Counters persist; only the rolling average resets daily.
    fn maybe_reset_average(&mut self) {
        let now = unix_timestamp();
        if now - self.last_reset_at > RESET_INTERVAL_SECS {
            self.avg_latency_ms = 0.0;
            self.latency_samples = 0;
            self.last_reset_at = now;
        }
    }

    fn record_latency(&mut self, latency_ms: u64) {
        let prev = self.avg_latency_ms * self.latency_samples as f64;
        self.latency_samples += 1;
        self.avg_latency_ms = (prev + latency_ms as f64) / self.latency_samples as f64;
    }
}

/// Process-wide metrics map, keyed by backend.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    map: DashMap<String, BackendMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a backend so snapshots include it from startup.
    pub fn register(&self, backend: &str) {
        self.map.entry(backend.to_string()).or_insert_with(BackendMetrics::new);
    }

    fn with_entry(&self, backend: &str, update: impl FnOnce(&mut BackendMetrics)) {
        let mut entry = self
            .map
            .entry(backend.to_string())
            .or_insert_with(BackendMetrics::new);
        entry.maybe_reset_average();
        update(&mut entry);
    }

    /// A request was dispatched to this backend (including cache hits and
    /// fallback attempts).
    pub fn record_request(&self, backend: &str) {
        self.with_entry(backend, |m| m.requests += 1);
    }

    /// A streaming request was initiated.
    pub fn record_stream_request(&self, backend: &str) {
        self.with_entry(backend, |m| m.stream_requests += 1);
    }

    /// Terminal success. Cache hits count as successes but do not feed the
    /// latency average.
    pub fn record_success(
        &self,
        backend: &str,
        latency_ms: u64,
        usage: Option<TokenUsage>,
        cost: Option<f64>,
        from_cache: bool,
    ) {
        self.with_entry(backend, |m| {
            m.successes += 1;
            if from_cache {
                m.cache_hits += 1;
            } else if latency_ms > 0 {
                m.record_latency(latency_ms);
            }
            if let Some(usage) = usage {
                m.input_tokens += usage.prompt_tokens;
                m.output_tokens += usage.completion_tokens;
                m.total_tokens += usage.total_tokens;
            }
            if let Some(cost) = cost {
                m.cost += cost;
            }
        });
    }

    /// Terminal failure. `timed_out` additionally bumps the timeout counter.
    pub fn record_failure(&self, backend: &str, timed_out: bool) {
        self.with_entry(backend, |m| {
            m.failures += 1;
            if timed_out {
                m.timeouts += 1;
            }
        });
    }

    pub fn snapshot(&self, backend: &str) -> Option<BackendMetrics> {
        self.map.get(backend).map(|m| m.clone())
    }

    /// Snapshot of every backend's metrics.
    pub fn all(&self) -> std::collections::HashMap<String, BackendMetrics> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Accumulated direct cost, or an estimate from token volume when no
    /// adapter ever reported cost directly.
    pub fn estimated_cost(&self, backend: &str, cost_per_1k_tokens: f64) -> f64 {
        let Some(m) = self.snapshot(backend) else { return 0.0 };
        if m.cost > 0.0 {
            return m.cost;
        }
        let estimate = cost_per_1k_tokens / 1000.0 * m.total_tokens as f64;
        (estimate * 10_000.0).round() / 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_terminal_counters_track_outcomes() {
        let metrics = MetricsRegistry::new();
        metrics.record_request("openai");
        metrics.record_success("openai", 120, Some(TokenUsage::new(10, 5)), None, false);
        metrics.record_request("openai");
        metrics.record_failure("openai", false);

        let m = metrics.snapshot("openai").unwrap();
        assert_eq!(m.requests, 2);
        assert_eq!(m.successes, 1);
        assert_eq!(m.failures, 1);
        assert_eq!(m.timeouts, 0);
        assert_eq!(m.input_tokens, 10);
        assert_eq!(m.output_tokens, 5);
        assert_eq!(m.total_tokens, 15);
    }

    #[test]
    fn success_plus_failure_equals_terminal_outcomes() {
        let metrics = MetricsRegistry::new();
        for _ in 0..3 {
            metrics.record_request("local");
            metrics.record_success("local", 10, None, None, false);
        }
        metrics.record_request("local");
        metrics.record_failure("local", true);
        // A cache hit is also a terminal outcome.
        metrics.record_request("local");
        metrics.record_success("local", 1, None, None, true);

        let m = metrics.snapshot("local").unwrap();
        assert_eq!(m.successes + m.failures, 5);
        assert_eq!(m.requests, 5);
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.timeouts, 1);
    }

    #[test]
    fn latency_average_is_cumulative_mean_of_noncached_successes() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("openai", 100, None, None, false);
        metrics.record_success("openai", 200, None, None, false);
        metrics.record_success("openai", 300, None, None, false);

        let m = metrics.snapshot("openai").unwrap();
        assert!((m.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_hits_do_not_move_the_latency_average() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("openai", 100, None, None, false);
        metrics.record_success("openai", 1, None, None, true);

        let m = metrics.snapshot("openai").unwrap();
        assert!((m.avg_latency_ms - 100.0).abs() < f64::EPSILON);
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.successes, 2);
    }

    #[test]
    fn success_rate_is_percentage_of_terminal_outcomes() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("x", 10, None, None, false);
        metrics.record_success("x", 10, None, None, false);
        metrics.record_success("x", 10, None, None, false);
        metrics.record_failure("x", false);

        let m = metrics.snapshot("x").unwrap();
        assert_eq!(m.success_rate(), 75.0);

        let empty = MetricsRegistry::new();
        empty.register("y");
        assert_eq!(empty.snapshot("y").unwrap().success_rate(), 0.0);
    }

    #[test]
    fn direct_cost_wins_over_estimation() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("openai", 10, Some(TokenUsage::new(500, 500)), Some(0.25), false);
        assert!((metrics.estimated_cost("openai", 0.01) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn cost_estimated_from_tokens_when_no_direct_cost() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("local", 10, Some(TokenUsage::new(1500, 500)), None, false);
        // 2000 tokens at 0.01 per 1k = 0.02
        assert!((metrics.estimated_cost("local", 0.01) - 0.02).abs() < 1e-9);
    }

    #[test]
    fn register_creates_zeroed_entry() {
        let metrics = MetricsRegistry::new();
        metrics.register("anthropic");
        let m = metrics.snapshot("anthropic").unwrap();
        assert_eq!(m.requests, 0);
        assert!(metrics.snapshot("missing").is_none());
        assert_eq!(metrics.all().len(), 1);
    }

    #[test]
    fn stale_rolling_average_resets_on_next_update() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("x", 500, None, None, false);

        // Simulate a >24h-old entry, then record again: average restarts.
        metrics.map.get_mut("x").unwrap().last_reset_at -= RESET_INTERVAL_SECS + 10.0;
        metrics.record_success("x", 100, None, None, false);

        let m = metrics.snapshot("x").unwrap();
        assert!((m.avg_latency_ms - 100.0).abs() < f64::EPSILON);
        // Counters persist across the reset.
        assert_eq!(m.successes, 2);
    }
}
