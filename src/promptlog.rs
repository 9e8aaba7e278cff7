//! In-memory prompt-data sink.
//!
//! Every routed request produces exactly one [`PromptLogEntry`] — the
//! envelope returned to the caller, reduced to its accounting fields. The
//! log is a fixed-capacity ring buffer: once full, the oldest entry is
//! evicted, giving a bounded memory footprint regardless of volume. Prompt
//! text itself is never stored, only its length.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::ResponseEnvelope;

/// Fixed-capacity ring buffer of recent [`PromptLogEntry`] records.
///
/// Safe to share via `Arc`. [`push`][Self::push] uses a non-blocking
/// `try_lock` so it never delays request handling; under lock contention the
/// entry is silently dropped.
pub struct PromptLog {
    capacity: usize,
    entries: Mutex<VecDeque<PromptLogEntry>>,
}

impl PromptLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request. Best-effort and non-blocking.
    pub fn push(&self, entry: PromptLogEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<PromptLogEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> PromptLogStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let mut model_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for entry in entries.iter() {
            *model_counts.entry(entry.model_used.clone()).or_default() += 1;
        }

        PromptLogStats {
            total_requests: total,
            error_count: entries.iter().filter(|e| e.error).count(),
            fallback_count: entries.iter().filter(|e| e.fallback).count(),
            cache_hit_count: entries.iter().filter(|e| e.from_cache).count(),
            avg_latency_ms,
            model_counts,
        }
    }
}

/// One routed request, reduced to its accounting fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptLogEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Prompt length in characters; the text itself is not retained.
    pub prompt_chars: usize,
    pub model_used: String,
    pub from_cache: bool,
    pub fallback: bool,
    pub streaming: bool,
    pub test_mode: bool,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub latency_ms: u64,
    pub total_tokens: u64,
}

impl PromptLogEntry {
    /// Build an entry from the envelope a request terminated with.
    pub fn from_envelope(prompt_chars: usize, envelope: &ResponseEnvelope) -> Self {
        Self {
            request_id: envelope.request_id.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            prompt_chars,
            model_used: envelope.model_used.clone(),
            from_cache: envelope.from_cache,
            fallback: envelope.fallback,
            streaming: false,
            test_mode: envelope.test_mode,
            error: envelope.error,
            error_type: envelope.error_type.clone(),
            latency_ms: envelope.latency_ms,
            total_tokens: envelope.total_tokens(),
        }
    }

    /// Mark this entry as a stream initialization record.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

/// Aggregates over the buffered entries.
#[derive(Debug, Serialize)]
pub struct PromptLogStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub fallback_count: usize,
    pub cache_hit_count: usize,
    pub avg_latency_ms: f64,
    pub model_counts: std::collections::HashMap<String, usize>,
}
