//! Backend health state.
//!
//! Each backend carries a [`BackendHealth`] record updated only by the
//! background probe loop (see the router) — never on the request path. The
//! status progression is `unknown → healthy ↔ degraded ↔ unhealthy`: a single
//! failed probe demotes one step, a successful probe restores `healthy`.
//! After a non-healthy result the next probe is scheduled at most 60 seconds
//! out, regardless of the backend's configured interval.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::unix_timestamp;

/// Probe recheck ceiling once a backend stops being healthy.
const UNHEALTHY_RECHECK_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    /// The adapter could not be constructed or probed at all.
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
        }
    }
}

/// Health record for one backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendHealth {
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp (seconds) of the next scheduled probe.
    pub next_check_at: f64,
    /// Latency of the last probe, when one completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl BackendHealth {
    /// Initial record: unknown status, first probe due immediately.
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked: None,
            error: None,
            next_check_at: unix_timestamp(),
            latency_ms: None,
        }
    }

    /// A successful probe result.
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_checked: Some(Utc::now()),
            error: None,
            next_check_at: unix_timestamp(),
            latency_ms: Some(latency_ms),
        }
    }

    /// A failed probe result.
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_checked: Some(Utc::now()),
            error: Some(error.into()),
            next_check_at: unix_timestamp(),
            latency_ms: None,
        }
    }
}

/// Process-wide health map, keyed by backend.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    map: DashMap<String, BackendHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: &str) {
        self.map
            .entry(backend.to_string())
            .or_insert_with(BackendHealth::unknown);
    }

    pub fn status(&self, backend: &str) -> HealthStatus {
        self.map
            .get(backend)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn get(&self, backend: &str) -> Option<BackendHealth> {
        self.map.get(backend).map(|h| h.clone())
    }

    pub fn all(&self) -> std::collections::HashMap<String, BackendHealth> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Record a probe outcome, applying the one-step demotion rule and
    /// scheduling the next probe.
    ///
    /// `interval_secs` is the backend's configured probe interval; non-healthy
    /// results are rechecked within [`UNHEALTHY_RECHECK_SECS`].
    pub fn apply_probe(&self, backend: &str, probe: BackendHealth, interval_secs: u64) {
        let previous = self.status(backend);
        let mut record = probe;

        record.status = match record.status {
            HealthStatus::Healthy => HealthStatus::Healthy,
            // One failed probe demotes a healthy backend to degraded; any
            // further failure lands on unhealthy.
            _ if previous == HealthStatus::Healthy => HealthStatus::Degraded,
            HealthStatus::Error => HealthStatus::Error,
            _ => HealthStatus::Unhealthy,
        };

        let delay = if record.status == HealthStatus::Healthy {
            interval_secs
        } else {
            interval_secs.min(UNHEALTHY_RECHECK_SECS)
        };
        record.next_check_at = unix_timestamp() + delay as f64;

        self.map.insert(backend.to_string(), record);
    }

    /// Record a permanent adapter failure (construction error).
    pub fn mark_error(&self, backend: &str, error: impl Into<String>) {
        let mut record = BackendHealth::unhealthy(error);
        record.status = HealthStatus::Error;
        record.next_check_at = unix_timestamp() + UNHEALTHY_RECHECK_SECS as f64;
        self.map.insert(backend.to_string(), record);
    }

    /// Backends whose next probe is due.
    pub fn due(&self) -> Vec<String> {
        let now = unix_timestamp();
        self.map
            .iter()
            .filter(|entry| entry.value().next_check_at <= now)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Aggregate gateway status: `healthy` when every backend is healthy,
    /// `degraded` when some are, `unhealthy` when none are (or none exist).
    pub fn aggregate(&self) -> (HealthStatus, String) {
        if self.map.is_empty() {
            return (HealthStatus::Unhealthy, "No models available".into());
        }

        let total = self.map.len();
        let healthy = self
            .map
            .iter()
            .filter(|e| e.value().status == HealthStatus::Healthy)
            .count();
        let unchecked = self
            .map
            .iter()
            .filter(|e| e.value().status == HealthStatus::Unknown)
            .count();

        if healthy == total {
            (HealthStatus::Healthy, "All systems operational".into())
        } else if healthy > 0 {
            (HealthStatus::Degraded, "Some models are unavailable".into())
        } else if unchecked == total {
            (HealthStatus::Degraded, "Health checks pending".into())
        } else {
            (HealthStatus::Unhealthy, "All models are unavailable".into())
        }
    }
}
