//! Backend adapters — uniform contract over concrete LLM providers.
//!
//! Every upstream is wrapped in a [`ModelAdapter`]: a unary `generate`, an
//! optional `stream`, a `health_probe`, and idempotent `close`. Adapter
//! failures never cross this boundary as errors — `generate` always returns
//! a [`ResponseEnvelope`], with `error=true` and a taxonomy `error_type`
//! when the upstream call failed. Provider-specific protocol details (auth
//! headers, endpoint paths, schema translation) are fully encapsulated in
//! the adapter modules.

mod anthropic;
mod local;
mod openai;
pub mod sse;

pub use anthropic::AnthropicAdapter;
pub use local::LocalAdapter;
pub use openai::OpenAiAdapter;

use std::borrow::Cow;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use tracing::{error, info};

use crate::config::Settings;
use crate::health::BackendHealth;
use crate::keystore::ProviderKeyStore;
use crate::registry::{BackendDescriptor, ModelRegistry};
use crate::types::{RequestMetadata, ResponseEnvelope, StreamChunk, StreamInit};

/// A `Send`-able, heap-allocated chunk stream.
///
/// Finite and non-restartable: terminates with exactly one chunk where
/// `done` is true (natural completion or an error chunk).
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Marker appended when a prompt is cut to the backend's length limit.
pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated due to length limits]";

/// Fixed prompt used by the default health probe.
const PROBE_PROMPT: &str = "Respond with 'OK' if you can read this message.";

/// Uniform adapter contract. Implementations own their upstream client.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// The immutable descriptor this adapter was built from.
    fn descriptor(&self) -> &Arc<BackendDescriptor>;

    /// Unary generation. Never fails: upstream errors come back as
    /// error-marked envelopes with `latency_ms` populated.
    async fn generate(&self, prompt: &str, metadata: &RequestMetadata) -> ResponseEnvelope;

    /// Streaming generation. Only available when the descriptor declares
    /// streaming support; the default refuses.
    async fn stream(
        &self,
        _prompt: &str,
        _metadata: &RequestMetadata,
    ) -> anyhow::Result<(StreamInit, ChunkStream)> {
        anyhow::bail!(
            "streaming not supported by backend `{}`",
            self.descriptor().key
        )
    }

    /// Probe the upstream with a fixed lightweight prompt.
    ///
    /// Healthy iff the call completes without the error flag. Adapters with a
    /// cheaper provider ping override this.
    async fn health_probe(&self) -> BackendHealth {
        let envelope = self.generate(PROBE_PROMPT, &RequestMetadata::default()).await;
        if envelope.error {
            BackendHealth::unhealthy(
                envelope
                    .error_details
                    .unwrap_or_else(|| "health probe failed".into()),
            )
        } else {
            BackendHealth::healthy(envelope.latency_ms)
        }
    }

    /// Release upstream client resources. Idempotent; default is a no-op
    /// because reqwest clients release on drop.
    async fn close(&self) {}

    /// Adapter-owned token estimation for texts the upstream didn't meter.
    fn estimate_tokens(&self, text: &str) -> u64;
}

/// Generation parameters resolved from metadata + adapter defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl GenerationParams {
    /// Apply defaults for absent fields and clamp `max_tokens` to the
    /// backend's maximum.
    pub fn resolve(
        descriptor: &BackendDescriptor,
        default_temperature: f64,
        default_max_tokens: u32,
        metadata: &RequestMetadata,
    ) -> Self {
        let requested = metadata.max_tokens.unwrap_or(default_max_tokens);
        Self {
            temperature: metadata.temperature.unwrap_or(default_temperature),
            max_tokens: requested.min(descriptor.max_tokens),
        }
    }
}

/// Truncate a prompt to the backend's limit, attaching a visible marker.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> Cow<'_, str> {
    if prompt.chars().count() <= max_chars {
        return Cow::Borrowed(prompt);
    }
    let head: String = prompt.chars().take(max_chars).collect();
    tracing::warn!(
        limit = max_chars,
        "prompt exceeds backend length limit, truncating"
    );
    Cow::Owned(format!("{head}{TRUNCATION_MARKER}"))
}

/// Map an upstream error message onto the adapter error taxonomy.
///
/// Providers rarely surface typed errors through plain HTTP, so inspection
/// is by substring, most-specific first.
pub fn classify_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();

    if lower.contains("rate limit") || lower.contains("429") {
        "rate_limit"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("authentication")
        || lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("401")
    {
        "authentication"
    } else if lower.contains("maximum context length")
        || lower.contains("token limit")
        || lower.contains("413")
    {
        "token_limit"
    } else if lower.contains("content filter") || lower.contains("content policy") {
        "content_filter"
    } else if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("refused")
        || lower.contains("dns")
    {
        "connection"
    } else if lower.contains("bad request") || lower.contains("400") {
        "bad_request"
    } else if lower.contains("server error")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        "server_error"
    } else {
        "unknown"
    }
}

/// Build one adapter per registry entry.
///
/// Credentials resolve through the provider key store first (active records
/// override configuration), then the settings file/environment. Adapter
/// selection is a static lookup by backend key — no dynamic loading.
pub fn build_adapters(
    settings: &Settings,
    registry: &ModelRegistry,
    keystore: &ProviderKeyStore,
) -> HashMap<String, Arc<dyn ModelAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn ModelAdapter>> = HashMap::new();

    for descriptor in registry.descriptors() {
        let adapter: Option<Arc<dyn ModelAdapter>> = match descriptor.key.as_str() {
            "local" => Some(Arc::new(LocalAdapter::new(
                Arc::clone(descriptor),
                &settings.local,
            ))),
            "openai" => {
                let mut config = settings.openai.clone();
                if let Some(record) = keystore.active("openai") {
                    info!("using stored credentials for openai");
                    record.apply_openai(&mut config);
                }
                Some(Arc::new(OpenAiAdapter::new(Arc::clone(descriptor), &config)))
            }
            "anthropic" => {
                let mut config = settings.anthropic.clone();
                if let Some(record) = keystore.active("anthropic") {
                    info!("using stored credentials for anthropic");
                    record.apply_anthropic(&mut config);
                }
                Some(Arc::new(AnthropicAdapter::new(
                    Arc::clone(descriptor),
                    &config,
                )))
            }
            other => {
                error!(backend = other, "no adapter implementation, skipping");
                None
            }
        };

        if let Some(adapter) = adapter {
            info!(
                backend = %descriptor.key,
                model = %descriptor.model_id,
                "initialized adapter"
            );
            adapters.insert(descriptor.key.clone(), adapter);
        }
    }

    adapters
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Scriptable adapter for router tests: fixed responses, forced failures,
/// and configurable artificial delay.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::time::Duration;

    pub enum MockBehavior {
        Respond(String),
        Fail { error_type: &'static str, message: String },
        Sleep(Duration),
    }

    pub struct MockAdapter {
        descriptor: Arc<BackendDescriptor>,
        behavior: MockBehavior,
    }

    impl MockAdapter {
        pub fn new(descriptor: Arc<BackendDescriptor>, behavior: MockBehavior) -> Self {
            Self { descriptor, behavior }
        }

        pub fn responding(descriptor: Arc<BackendDescriptor>, text: &str) -> Self {
            Self::new(descriptor, MockBehavior::Respond(text.into()))
        }

        pub fn failing(
            descriptor: Arc<BackendDescriptor>,
            error_type: &'static str,
            message: &str,
        ) -> Self {
            Self::new(
                descriptor,
                MockBehavior::Fail { error_type, message: message.into() },
            )
        }

        pub fn sleeping(descriptor: Arc<BackendDescriptor>, duration: Duration) -> Self {
            Self::new(descriptor, MockBehavior::Sleep(duration))
        }
    }

    #[async_trait]
    impl ModelAdapter for MockAdapter {
        fn descriptor(&self) -> &Arc<BackendDescriptor> {
            &self.descriptor
        }

        async fn generate(&self, prompt: &str, _metadata: &RequestMetadata) -> ResponseEnvelope {
            match &self.behavior {
                MockBehavior::Respond(text) => {
                    let mut envelope = ResponseEnvelope::success(
                        &self.descriptor.key,
                        &self.descriptor.model_id,
                        text.clone(),
                        5,
                    );
                    envelope.token_usage = Some(crate::types::TokenUsage::new(
                        self.estimate_tokens(prompt),
                        self.estimate_tokens(text),
                    ));
                    envelope
                }
                MockBehavior::Fail { error_type, message } => {
                    ResponseEnvelope::failure(&self.descriptor.key, error_type, message.clone(), 3)
                }
                MockBehavior::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    ResponseEnvelope::success(
                        &self.descriptor.key,
                        &self.descriptor.model_id,
                        "slow response".into(),
                        duration.as_millis() as u64,
                    )
                }
            }
        }

        async fn stream(
            &self,
            _prompt: &str,
            _metadata: &RequestMetadata,
        ) -> anyhow::Result<(StreamInit, ChunkStream)> {
            let MockBehavior::Respond(text) = &self.behavior else {
                anyhow::bail!("mock stream unavailable");
            };
            let text = text.clone();
            let stream = async_stream::stream! {
                yield StreamChunk {
                    chunk: text,
                    done: false,
                    latency_ms: 1,
                    time_to_first_chunk_ms: Some(1),
                    ..StreamChunk::default()
                };
                yield StreamChunk { done: true, latency_ms: 2, ..StreamChunk::default() };
            };
            Ok((
                StreamInit {
                    model_id: self.descriptor.model_id.clone(),
                    provider: self.descriptor.provider.clone(),
                },
                Box::pin(stream),
            ))
        }

        fn estimate_tokens(&self, text: &str) -> u64 {
            (text.len() as u64 / 4).max(1)
        }
    }
}
