//! Shared request/response vocabulary.
//!
//! Every boundary in the gateway — HTTP handlers, router, cache, adapters —
//! exchanges the same two shapes: [`RequestMetadata`] going in and
//! [`ResponseEnvelope`] coming out. Adapter failures are *data* on the
//! envelope (`error`, `error_type`, `error_details`), never panics or `Err`
//! values crossing the adapter boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Selection priority a caller can request via metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Speed,
    Quality,
    Cost,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Quality => "quality",
            Self::Cost => "cost",
        }
    }
}

/// Caller-supplied request metadata.
///
/// All recognized fields are optional; unknown fields are preserved in
/// `extra` but ignored by the routing core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// `speed`, `quality` or `cost` — biases backend scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Force a specific backend key (`local`, `openai`, `anthropic`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Per-request deadline in seconds.
    #[serde(default, alias = "timeout_seconds", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Whether the response cache may serve or store this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Capability tags the selected backend must support.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<crate::registry::Capability>,

    /// Request a streaming response (honored only when the backend streams).
    #[serde(default)]
    pub stream: bool,

    /// Override the cache TTL (seconds) for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,

    /// Unrecognized fields — carried through untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl RequestMetadata {
    /// Effective cache opt-in, falling back to the configured default.
    pub fn use_cache_or(&self, default: bool) -> bool {
        self.use_cache.unwrap_or(default)
    }

    /// Effective deadline in seconds, falling back to the configured default.
    pub fn timeout_or(&self, default: f64) -> f64 {
        self.timeout.unwrap_or(default)
    }
}

/// How the classifier (or router) arrived at a backend choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    MetadataOverride,
    RuleBased,
    Cache,
    CapabilityBased,
    FallbackClassification,
}

/// Outcome of classifying one prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationResult {
    pub selected_model: String,
    /// Normalized confidence in `[0, 1]`.
    pub confidence: f64,
    pub source: ClassificationSource,
    /// Diagnostic blob: keyword counts, feature values, raw and adjusted scores.
    pub reasoning: Value,
    /// Set by the router when an unhealthy backend was routed around.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_fallback: Option<bool>,
    /// The originally selected backend, preserved across a health fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
}

impl ClassificationResult {
    /// A forced selection with full confidence (metadata override).
    pub fn overridden(model: &str) -> Self {
        Self {
            selected_model: model.to_string(),
            confidence: 1.0,
            source: ClassificationSource::MetadataOverride,
            reasoning: serde_json::json!({ "override": true }),
            health_fallback: None,
            original_model: None,
        }
    }
}

/// Token accounting for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// True when the counts were estimated rather than reported upstream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub estimated: bool,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: false,
        }
    }

    pub fn estimated(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            estimated: true,
            ..Self::new(prompt_tokens, completion_tokens)
        }
    }
}

/// The one response shape returned by the router for every call.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResponseEnvelope {
    /// Backend key that produced the response (`"none"` when all failed).
    pub model_used: String,

    /// Upstream model id, e.g. `gpt-4o`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    /// Generated text, or a human-readable error message when `error` is set.
    pub response: String,

    /// Wall-clock latency, including retries for error envelopes.
    pub latency_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_cache: bool,

    /// Fingerprint the envelope was served under (cache hits only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_latency_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,

    /// Unix timestamp (seconds) when the envelope was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,

    /// Cost in USD, computed by the adapter or estimated by the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,

    /// Upstream finish/stop reason when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub test_mode: bool,

    /// Backends tried, in order, when fallback was exhausted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<String>,
}

impl ResponseEnvelope {
    /// Successful envelope skeleton; the adapter fills usage/cost afterwards.
    pub fn success(model_used: &str, model_id: &str, response: String, latency_ms: u64) -> Self {
        Self {
            model_used: model_used.to_string(),
            model_id: Some(model_id.to_string()),
            response,
            latency_ms,
            timestamp: Some(unix_timestamp()),
            ..Self::default()
        }
    }

    /// Error envelope. `error_type` is one of the adapter taxonomy strings.
    pub fn failure(
        model_used: &str,
        error_type: &str,
        details: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        let details = details.into();
        Self {
            model_used: model_used.to_string(),
            response: format!("Error: {details}"),
            latency_ms,
            error: true,
            error_type: Some(error_type.to_string()),
            error_details: Some(details),
            timestamp: Some(unix_timestamp()),
            ..Self::default()
        }
    }

    /// Total tokens processed, or 0 when usage is unknown.
    pub fn total_tokens(&self) -> u64 {
        self.token_usage.map(|u| u.total_tokens).unwrap_or(0)
    }
}

/// One unit of a streaming response.
///
/// The stream terminates with exactly one chunk where `done` is true — either
/// the natural end of generation or an error chunk carrying `error_details`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamChunk {
    /// Incremental text (may be empty on the terminal chunk).
    pub chunk: String,
    pub done: bool,
    /// Milliseconds since the stream call began.
    pub latency_ms: u64,
    /// Set on the first chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_chunk_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// True on the trailing note summarizing a partially-delivered response.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial_response: bool,
}

/// Metadata available as soon as a stream has been initialized, before any
/// content chunk arrives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamInit {
    pub model_id: String,
    pub provider: String,
}

/// Current Unix time in (fractional) seconds.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
