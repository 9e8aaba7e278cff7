//! Request routing — the brain of promptgate.
//!
//! One call, one envelope. For every prompt the router runs the same
//! pipeline: cache lookup → prompt preprocessing → backend selection
//! (capability requirements, caller override, or classifier) → health and
//! availability gates → dispatch under a deadline → fallback on retryable
//! failures → metrics, cache write-through and prompt-log accounting.
//!
//! Streaming requests branch off after selection: the cache is bypassed and
//! the caller receives initialization metadata plus a lazy chunk stream.
//!
//! The registry and adapters are immutable after construction; health and
//! metrics are concurrent maps. Health probes run on a single background
//! loop, strictly off the request path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::{truncate_prompt, ChunkStream, ModelAdapter};
use crate::cache::ResponseCache;
use crate::classifier::PromptClassifier;
use crate::config::Settings;
use crate::error::RouteError;
use crate::health::{BackendHealth, HealthRegistry, HealthStatus};
use crate::metrics::MetricsRegistry;
use crate::promptlog::{PromptLog, PromptLogEntry};
use crate::registry::{Capability, ModelRegistry};
use crate::types::{
    unix_timestamp, ClassificationResult, ClassificationSource, Priority, RequestMetadata,
    ResponseEnvelope,
};

/// Interval at which the health loop wakes to look for due probes.
const HEALTH_LOOP_TICK: Duration = Duration::from_secs(10);

/// What a routed request resolves to.
pub enum RouteReply {
    /// Completed unary response.
    Envelope(ResponseEnvelope),
    /// Initialized stream; content arrives lazily through `stream`.
    Stream(StreamingResponse),
}

impl std::fmt::Debug for RouteReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteReply::Envelope(envelope) => f.debug_tuple("Envelope").field(envelope).finish(),
            RouteReply::Stream(stream) => f
                .debug_struct("Stream")
                .field("model_used", &stream.model_used)
                .field("model_id", &stream.model_id)
                .field("request_id", &stream.request_id)
                .finish(),
        }
    }
}

impl RouteReply {
    /// The unary envelope, if this reply is one (test convenience).
    pub fn into_envelope(self) -> Option<ResponseEnvelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Stream(_) => None,
        }
    }
}

/// Metadata available once a stream has been initialized, plus the chunk
/// sequence itself.
pub struct StreamingResponse {
    pub model_used: String,
    pub model_id: String,
    pub request_id: String,
    pub init_latency_ms: u64,
    pub fallback: bool,
    pub fallback_reason: Option<String>,
    pub classification: Option<ClassificationResult>,
    pub test_mode: bool,
    pub stream: ChunkStream,
}

/// Registry enumeration entry for the models endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub avg_latency_ms: u64,
    pub cost_per_1k_tokens: f64,
    pub max_tokens: u32,
    pub supports_streaming: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<BackendHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ModelMetricsSummary>,
}

/// Metrics block exposed per model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetricsSummary {
    pub requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub cache_hits: u64,
    pub stream_requests: u64,
    pub timeouts: u64,
}

/// Aggregate health view for the health endpoints.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub models: HashMap<String, BackendHealth>,
    pub metrics: HashMap<String, ModelMetricsSummary>,
}

/// Core router. Shared as `Arc<ModelRouter>` by every request handler.
pub struct ModelRouter {
    settings: Arc<Settings>,
    registry: Arc<ModelRegistry>,
    classifier: Arc<PromptClassifier>,
    cache: Arc<ResponseCache>,
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
    pub health: Arc<HealthRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub prompt_log: Arc<PromptLog>,
    pub started_at: Instant,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ModelRouter {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<ModelRegistry>,
        classifier: Arc<PromptClassifier>,
        cache: Arc<ResponseCache>,
        adapters: HashMap<String, Arc<dyn ModelAdapter>>,
        prompt_log: Arc<PromptLog>,
    ) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new());
        for key in adapters.keys() {
            health.register(key);
            metrics.register(key);
        }

        info!(adapters = adapters.len(), "model router initialized");

        Self {
            settings,
            registry,
            classifier,
            cache,
            adapters,
            health,
            metrics,
            prompt_log,
            started_at: Instant::now(),
            health_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn has_backend(&self, key: &str) -> bool {
        self.adapters.contains_key(key)
    }

    // -----------------------------------------------------------------------
    // Main pipeline
    // -----------------------------------------------------------------------

    /// Route a prompt to the best-suited backend.
    #[tracing::instrument(skip(self, prompt, metadata), fields(request_id = tracing::field::Empty, backend = tracing::field::Empty))]
    pub async fn route(&self, prompt: &str, mut metadata: RequestMetadata) -> RouteReply {
        let start = Instant::now();
        let request_id = metadata
            .request_id
            .clone()
            .unwrap_or_else(generate_request_id);
        metadata.request_id = Some(request_id.clone());
        tracing::Span::current().record("request_id", request_id.as_str());

        if prompt.trim().is_empty() {
            let mut envelope = ResponseEnvelope::failure(
                "none",
                "invalid_prompt",
                "Prompt cannot be empty",
                start.elapsed().as_millis() as u64,
            );
            envelope.request_id = Some(request_id);
            self.log_envelope(prompt, &envelope);
            return RouteReply::Envelope(envelope);
        }

        info!(chars = prompt.chars().count(), "processing prompt");

        // Step 1: cache lookup (streaming always bypasses the cache).
        let use_cache = metadata.use_cache_or(self.settings.cache.enabled);
        if use_cache && !metadata.stream {
            if let Some(mut cached) = self.cache.get(prompt, &metadata).await {
                let cache_latency = start.elapsed().as_millis() as u64;
                cached.cache_latency_ms = Some(cache_latency);
                cached.from_cache = true;
                cached.request_id = Some(request_id);

                let model_key = cached.model_used.clone();
                self.metrics.record_request(&model_key);
                self.metrics.record_success(
                    &model_key,
                    cache_latency,
                    cached.token_usage,
                    None,
                    true,
                );

                info!(backend = %model_key, "serving cached response");
                self.log_envelope(prompt, &cached);
                return RouteReply::Envelope(cached);
            }
        }

        // Step 2: preprocess — cap the prompt at the configured length.
        let processed = truncate_prompt(prompt, self.settings.api.max_prompt_length);

        // Step 3: backend selection.
        let (model_key, mut classification) = self.select_backend(&processed, &metadata);

        // Step 4: health gate — route around unhealthy backends.
        let model_key = self.apply_health_gate(model_key, &mut classification);

        // Step 5: availability gate — the selection must have an adapter.
        let model_key = match self.apply_availability_gate(model_key, &mut classification) {
            Ok(key) => key,
            Err(mut envelope) => {
                envelope.request_id = Some(request_id);
                envelope.latency_ms = start.elapsed().as_millis() as u64;
                self.log_envelope(prompt, &envelope);
                return RouteReply::Envelope(envelope);
            }
        };
        tracing::Span::current().record("backend", model_key.as_str());

        // Step 6: streaming branch.
        let streams = self
            .registry
            .get(&model_key)
            .map(|d| d.supports_streaming)
            .unwrap_or(false);
        if metadata.stream && streams {
            return self
                .dispatch_stream(model_key, &processed, &metadata, request_id, classification)
                .await;
        }

        // Step 7: unary dispatch under a deadline.
        let timeout_secs = metadata.timeout_or(self.settings.api.default_request_timeout);
        info!(backend = %model_key, timeout_secs, "dispatching prompt");
        self.metrics.record_request(&model_key);
        let mut envelope = self
            .dispatch(&model_key, &processed, &metadata, timeout_secs)
            .await;

        if !envelope.error {
            self.finish_success(&model_key, &mut envelope, &request_id, classification);
            if use_cache {
                self.cache.set(prompt, &envelope, &metadata).await;
            }
            self.log_envelope(prompt, &envelope);
            return RouteReply::Envelope(envelope);
        }

        // Step 8: failure path — classify and fall back where eligible.
        let error_type = envelope.error_type.as_deref().unwrap_or("unknown");
        let timed_out = error_type == "timeout";
        self.metrics.record_failure(&model_key, timed_out);
        warn!(backend = %model_key, error_type, "backend call failed");

        if self.should_fallback(error_type) {
            let error_message = envelope
                .error_details
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            return self
                .handle_fallback(
                    &model_key,
                    &processed,
                    &metadata,
                    prompt,
                    request_id,
                    classification,
                    error_message,
                    start,
                )
                .await;
        }

        envelope.request_id = Some(request_id);
        envelope.latency_ms = start.elapsed().as_millis() as u64;
        envelope.classification = Some(classification);
        self.log_envelope(prompt, &envelope);
        RouteReply::Envelope(envelope)
    }

    /// Call a specific backend directly, bypassing classifier and cache.
    pub async fn test_model(
        &self,
        model_key: &str,
        prompt: &str,
        mut metadata: RequestMetadata,
    ) -> Result<RouteReply, RouteError> {
        let Some(adapter) = self.adapters.get(model_key) else {
            return Err(RouteError::ModelNotAvailable(model_key.to_string()));
        };

        let request_id = metadata
            .request_id
            .clone()
            .unwrap_or_else(|| format!("test_{}", generate_request_id()));
        metadata.request_id = Some(request_id.clone());
        info!(backend = %model_key, "testing model directly");

        let streams = adapter.descriptor().supports_streaming;
        if metadata.stream && streams {
            let start = Instant::now();
            self.metrics.record_request(model_key);
            self.metrics.record_stream_request(model_key);
            match adapter.stream(prompt, &metadata).await {
                Ok((init, stream)) => {
                    return Ok(RouteReply::Stream(StreamingResponse {
                        model_used: model_key.to_string(),
                        model_id: init.model_id,
                        request_id,
                        init_latency_ms: start.elapsed().as_millis() as u64,
                        fallback: false,
                        fallback_reason: None,
                        classification: None,
                        test_mode: true,
                        stream,
                    }));
                }
                Err(e) => {
                    self.metrics.record_failure(model_key, false);
                    let mut envelope = ResponseEnvelope::failure(
                        model_key,
                        "unknown",
                        e.to_string(),
                        start.elapsed().as_millis() as u64,
                    );
                    envelope.test_mode = true;
                    envelope.request_id = Some(request_id);
                    self.log_envelope(prompt, &envelope);
                    return Ok(RouteReply::Envelope(envelope));
                }
            }
        }

        self.metrics.record_request(model_key);
        let mut envelope = adapter.generate(prompt, &metadata).await;
        envelope.test_mode = true;
        envelope.request_id = Some(request_id);

        if envelope.error {
            self.metrics
                .record_failure(model_key, envelope.error_type.as_deref() == Some("timeout"));
        } else {
            self.metrics.record_success(
                model_key,
                envelope.latency_ms,
                envelope.token_usage,
                envelope.cost,
                false,
            );
        }

        self.log_envelope(prompt, &envelope);
        Ok(RouteReply::Envelope(envelope))
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    fn select_backend(
        &self,
        prompt: &str,
        metadata: &RequestMetadata,
    ) -> (String, ClassificationResult) {
        if !metadata.required_capabilities.is_empty() {
            let key = self.select_by_capabilities(&metadata.required_capabilities, prompt, metadata);
            let classification = ClassificationResult {
                selected_model: key.clone(),
                confidence: 1.0,
                source: ClassificationSource::CapabilityBased,
                reasoning: json!({
                    "required_capabilities": metadata.required_capabilities,
                }),
                health_fallback: None,
                original_model: None,
            };
            return (key, classification);
        }

        if let Some(requested) = metadata.model.as_deref() {
            if self.adapters.contains_key(requested) {
                return (
                    requested.to_string(),
                    ClassificationResult::overridden(requested),
                );
            }
            warn!(model = requested, "requested backend unavailable, classifying instead");
            let (key, mut classification) = self.classifier.classify(prompt, metadata);
            classification.source = ClassificationSource::FallbackClassification;
            return (key, classification);
        }

        self.classifier.classify(prompt, metadata)
    }

    /// Choose among backends satisfying the required capability tags.
    ///
    /// ALL-tags matches are preferred; when none qualify the requirement is
    /// relaxed to ANY tag, and when even that fails the classifier decides.
    /// Multiple candidates are ordered by the priority dimension from
    /// metadata (quality when unspecified).
    fn select_by_capabilities(
        &self,
        required: &[Capability],
        prompt: &str,
        metadata: &RequestMetadata,
    ) -> String {
        let available: Vec<_> = self
            .registry
            .descriptors()
            .filter(|d| self.adapters.contains_key(&d.key))
            .collect();

        let mut candidates: Vec<_> = available
            .iter()
            .filter(|d| d.supports_all(required))
            .collect();
        if candidates.is_empty() {
            warn!(?required, "no backend supports all required capabilities, relaxing to any");
            candidates = available.iter().filter(|d| d.supports_any(required)).collect();
        }
        if candidates.is_empty() {
            warn!("no capability matches at all, falling back to classification");
            return self.classifier.classify(prompt, metadata).0;
        }

        let dimension = metadata.priority.unwrap_or(Priority::Quality);
        candidates.sort_by_key(|d| d.priority.rank(dimension));
        candidates[0].key.clone()
    }

    fn apply_health_gate(
        &self,
        model_key: String,
        classification: &mut ClassificationResult,
    ) -> String {
        if self.health.status(&model_key) != HealthStatus::Unhealthy {
            return model_key;
        }

        warn!(backend = %model_key, "selected backend is unhealthy, looking for alternative");
        for alternative in self.fallback_order(&model_key) {
            if self.adapters.contains_key(&alternative)
                && self.health.status(&alternative) != HealthStatus::Unhealthy
            {
                info!(backend = %alternative, "using healthy alternative");
                classification.health_fallback = Some(true);
                classification.original_model = Some(model_key);
                return alternative;
            }
        }

        // Nothing healthier exists; let the dispatch (and fallback walk)
        // take its course.
        model_key
    }

    fn apply_availability_gate(
        &self,
        model_key: String,
        classification: &mut ClassificationResult,
    ) -> Result<String, ResponseEnvelope> {
        if self.adapters.contains_key(&model_key) {
            return Ok(model_key);
        }

        warn!(backend = %model_key, "selected backend has no adapter");
        let substitute = self
            .fallback_order(&model_key)
            .into_iter()
            .find(|key| self.adapters.contains_key(key));

        match substitute {
            Some(key) => {
                classification.original_model = Some(model_key);
                Ok(key)
            }
            None => {
                error!("no model adapters available");
                Err(ResponseEnvelope::failure(
                    "none",
                    "model_unavailable",
                    "No model adapters available",
                    0,
                ))
            }
        }
    }

    /// Fallback order for a backend: descriptor-configured when registered,
    /// settings-derived otherwise.
    fn fallback_order(&self, model_key: &str) -> Vec<String> {
        match self.registry.get(model_key) {
            Some(descriptor) => descriptor.fallback.clone(),
            None => self.settings.fallback_order(model_key),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Call one adapter under the per-request deadline. Deadline expiry
    /// becomes a `timeout` error envelope.
    async fn dispatch(
        &self,
        model_key: &str,
        prompt: &str,
        metadata: &RequestMetadata,
        timeout_secs: f64,
    ) -> ResponseEnvelope {
        let adapter = Arc::clone(&self.adapters[model_key]);
        let start = Instant::now();
        match tokio::time::timeout(
            Duration::from_secs_f64(timeout_secs),
            adapter.generate(prompt, metadata),
        )
        .await
        {
            Ok(envelope) => envelope,
            Err(_) => {
                warn!(backend = %model_key, timeout_secs, "request deadline expired");
                ResponseEnvelope::failure(
                    model_key,
                    "timeout",
                    format!("Request timed out after {timeout_secs}s"),
                    start.elapsed().as_millis() as u64,
                )
            }
        }
    }

    fn finish_success(
        &self,
        model_key: &str,
        envelope: &mut ResponseEnvelope,
        request_id: &str,
        classification: ClassificationResult,
    ) {
        // Cost: adapter-reported when available, otherwise estimated from
        // the descriptor's per-1k rate.
        if envelope.cost.is_none() {
            if let Some(descriptor) = self.registry.get(model_key) {
                let estimate = descriptor.cost_per_1k_tokens / 1000.0
                    * envelope.total_tokens() as f64;
                envelope.cost = Some((estimate * 1_000_000.0).round() / 1_000_000.0);
            }
        }

        self.metrics.record_success(
            model_key,
            envelope.latency_ms,
            envelope.token_usage,
            envelope.cost,
            false,
        );

        envelope.request_id = Some(request_id.to_string());
        envelope.classification = Some(classification);
        envelope.from_cache = false;
        if envelope.timestamp.is_none() {
            envelope.timestamp = Some(unix_timestamp());
        }
    }

    fn should_fallback(&self, error_type: &str) -> bool {
        if !self.settings.fallback.enabled {
            return false;
        }
        match error_type {
            "timeout" => self.settings.fallback.retry_on_timeout,
            "rate_limit" => self.settings.fallback.retry_on_rate_limit,
            "server_error" => self.settings.fallback.retry_on_server_error,
            // Anything else is an unknown class: always worth one more try.
            _ => true,
        }
    }

    /// Walk the fallback order after a primary failure.
    #[allow(clippy::too_many_arguments)]
    async fn handle_fallback(
        &self,
        primary: &str,
        processed_prompt: &str,
        metadata: &RequestMetadata,
        original_prompt: &str,
        request_id: String,
        classification: ClassificationResult,
        error_message: String,
        start: Instant,
    ) -> RouteReply {
        let order = self.fallback_order(primary);
        let max_retries = self.settings.fallback.max_retries;
        let timeout_secs = metadata.timeout_or(self.settings.api.default_request_timeout);

        let tried: Vec<String> = order
            .iter()
            .filter(|key| *key != primary && self.adapters.contains_key(*key))
            .take(max_retries)
            .cloned()
            .collect();

        for fallback_key in &tried {
            info!(backend = %fallback_key, primary, "attempting fallback");
            self.metrics.record_request(fallback_key);
            let mut envelope = self
                .dispatch(fallback_key, processed_prompt, metadata, timeout_secs)
                .await;

            if envelope.error {
                let timed_out = envelope.error_type.as_deref() == Some("timeout");
                self.metrics.record_failure(fallback_key, timed_out);
                warn!(backend = %fallback_key, "fallback attempt failed");
                continue;
            }

            self.finish_success(fallback_key, &mut envelope, &request_id, classification);
            envelope.fallback = true;
            envelope.fallback_reason =
                Some(format!("Primary model ({primary}) failed: {error_message}"));

            // Write-through is attempted for symmetry, but the cache refuses
            // fallback envelopes, so this is a no-op by policy.
            if metadata.use_cache_or(self.settings.cache.enabled) {
                self.cache.set(original_prompt, &envelope, metadata).await;
            }

            self.log_envelope(original_prompt, &envelope);
            return RouteReply::Envelope(envelope);
        }

        let mut attempts = vec![primary.to_string()];
        attempts.extend(tried);

        let mut envelope = ResponseEnvelope::failure(
            "none",
            "all_models_failed",
            format!("All models failed. Original error: {error_message}"),
            start.elapsed().as_millis() as u64,
        );
        envelope.request_id = Some(request_id);
        envelope.classification = Some(classification);
        envelope.attempts = attempts;

        error!(attempts = ?envelope.attempts, "fallback exhausted");
        self.log_envelope(original_prompt, &envelope);
        RouteReply::Envelope(envelope)
    }

    /// Initialize a streaming dispatch, with stream-capable fallback.
    async fn dispatch_stream(
        &self,
        model_key: String,
        prompt: &str,
        metadata: &RequestMetadata,
        request_id: String,
        classification: ClassificationResult,
    ) -> RouteReply {
        let start = Instant::now();
        info!(backend = %model_key, "initiating streaming request");
        self.metrics.record_request(&model_key);
        self.metrics.record_stream_request(&model_key);

        let adapter = Arc::clone(&self.adapters[&model_key]);
        match adapter.stream(prompt, metadata).await {
            Ok((init, stream)) => {
                let response = StreamingResponse {
                    model_used: model_key.clone(),
                    model_id: init.model_id,
                    request_id: request_id.clone(),
                    init_latency_ms: start.elapsed().as_millis() as u64,
                    fallback: false,
                    fallback_reason: None,
                    classification: Some(classification),
                    test_mode: false,
                    stream,
                };
                self.log_stream_init(prompt, &response);
                RouteReply::Stream(response)
            }
            Err(e) => {
                self.metrics.record_failure(&model_key, false);
                warn!(backend = %model_key, error = %e, "stream initialization failed");

                if self.settings.fallback.enabled {
                    let candidates: Vec<String> = self
                        .fallback_order(&model_key)
                        .into_iter()
                        .filter(|key| {
                            key != &model_key
                                && self.adapters.contains_key(key)
                                && self
                                    .registry
                                    .get(key)
                                    .map(|d| d.supports_streaming)
                                    .unwrap_or(false)
                        })
                        .take(self.settings.fallback.max_retries)
                        .collect();

                    for fallback_key in candidates {
                        info!(backend = %fallback_key, "attempting streaming fallback");
                        self.metrics.record_request(&fallback_key);
                        self.metrics.record_stream_request(&fallback_key);
                        let adapter = Arc::clone(&self.adapters[&fallback_key]);
                        match adapter.stream(prompt, metadata).await {
                            Ok((init, stream)) => {
                                let response = StreamingResponse {
                                    model_used: fallback_key.clone(),
                                    model_id: init.model_id,
                                    request_id: request_id.clone(),
                                    init_latency_ms: start.elapsed().as_millis() as u64,
                                    fallback: true,
                                    fallback_reason: Some(format!(
                                        "Primary model ({model_key}) failed: {e}"
                                    )),
                                    classification: Some(classification),
                                    test_mode: false,
                                    stream,
                                };
                                self.log_stream_init(prompt, &response);
                                return RouteReply::Stream(response);
                            }
                            Err(fallback_err) => {
                                self.metrics.record_failure(&fallback_key, false);
                                warn!(
                                    backend = %fallback_key,
                                    error = %fallback_err,
                                    "streaming fallback failed"
                                );
                            }
                        }
                    }
                }

                let mut envelope = ResponseEnvelope::failure(
                    &model_key,
                    "unknown",
                    format!("Error initializing stream: {e}"),
                    start.elapsed().as_millis() as u64,
                );
                envelope.request_id = Some(request_id);
                envelope.classification = Some(classification);
                self.log_envelope(prompt, &envelope);
                RouteReply::Envelope(envelope)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Enumerate registered backends with optional health/metrics blocks.
    pub fn available_models(&self, include_health: bool) -> Vec<ModelInfo> {
        self.registry
            .descriptors()
            .filter(|d| self.adapters.contains_key(&d.key))
            .map(|d| ModelInfo {
                id: d.key.clone(),
                name: d.name.clone(),
                provider: d.provider.clone(),
                capabilities: d.capabilities.clone(),
                avg_latency_ms: d.avg_latency_ms,
                cost_per_1k_tokens: d.cost_per_1k_tokens,
                max_tokens: d.max_tokens,
                supports_streaming: d.supports_streaming,
                description: d.description.clone(),
                health: include_health.then(|| self.health.get(&d.key)).flatten(),
                metrics: include_health.then(|| self.metrics_summary(&d.key)).flatten(),
            })
            .collect()
    }

    fn metrics_summary(&self, model_key: &str) -> Option<ModelMetricsSummary> {
        let snapshot = self.metrics.snapshot(model_key)?;
        let cost_per_1k = self
            .registry
            .get(model_key)
            .map(|d| d.cost_per_1k_tokens)
            .unwrap_or(0.0);
        Some(ModelMetricsSummary {
            requests: snapshot.requests,
            success_rate: snapshot.success_rate(),
            avg_latency_ms: snapshot.avg_latency_ms,
            total_tokens: snapshot.total_tokens,
            estimated_cost: self.metrics.estimated_cost(model_key, cost_per_1k),
            cache_hits: snapshot.cache_hits,
            stream_requests: snapshot.stream_requests,
            timeouts: snapshot.timeouts,
        })
    }

    /// Current health across all backends, from the probe loop's last pass.
    pub fn health_report(&self) -> HealthReport {
        let (status, message) = self.health.aggregate();
        let metrics = self
            .adapters
            .keys()
            .filter_map(|key| Some((key.clone(), self.metrics_summary(key)?)))
            .collect();
        HealthReport {
            status,
            message,
            models: self.health.all(),
            metrics,
        }
    }

    // -----------------------------------------------------------------------
    // Background health loop + shutdown
    // -----------------------------------------------------------------------

    /// Start the single background probe loop.
    ///
    /// Wakes every 10 seconds and probes any backend whose `next_check_at`
    /// has passed. No-op when health checks are disabled in config.
    pub fn spawn_health_loop(self: &Arc<Self>) {
        if !self.settings.api.enable_health_checks {
            info!("model health checks disabled");
            return;
        }

        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_LOOP_TICK);
            // The initial tick fires immediately so startup gets a first pass.
            loop {
                tick.tick().await;
                for key in router.health.due() {
                    let Some(adapter) = router.adapters.get(&key) else { continue };
                    debug!(backend = %key, "running health probe");
                    let probe = adapter.health_probe().await;
                    let interval = router
                        .registry
                        .get(&key)
                        .map(|d| d.health_check_interval)
                        .unwrap_or(router.settings.api.health_check_interval);
                    router.health.apply_probe(&key, probe, interval);
                }
            }
        });

        *self.health_task.lock().expect("health task lock poisoned") = Some(handle);
        info!("started model health check loop");
    }

    /// Cancel the health loop and release adapter + cache resources.
    pub async fn close(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .expect("health task lock poisoned")
            .take()
        {
            handle.abort();
        }

        for (key, adapter) in &self.adapters {
            debug!(backend = %key, "closing adapter");
            adapter.close().await;
        }
        self.cache.close().await;
        info!("router resources closed");
    }

    // -----------------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------------

    fn log_envelope(&self, prompt: &str, envelope: &ResponseEnvelope) {
        self.prompt_log
            .push(PromptLogEntry::from_envelope(prompt.chars().count(), envelope));
    }

    fn log_stream_init(&self, prompt: &str, response: &StreamingResponse) {
        let envelope = ResponseEnvelope {
            model_used: response.model_used.clone(),
            model_id: Some(response.model_id.clone()),
            request_id: Some(response.request_id.clone()),
            latency_ms: response.init_latency_ms,
            fallback: response.fallback,
            fallback_reason: response.fallback_reason.clone(),
            test_mode: response.test_mode,
            ..ResponseEnvelope::default()
        };
        self.prompt_log.push(
            PromptLogEntry::from_envelope(prompt.chars().count(), &envelope).streaming(),
        );
    }
}

/// Fresh request id: `req_<8-hex>_<unix-seconds>`.
pub fn generate_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", &hex[..8], unix_timestamp() as u64)
}
