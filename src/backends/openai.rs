//! Hosted OpenAI-compatible adapter.
//!
//! Speaks the standard `/chat/completions` protocol against the configured
//! base URL (`https://api.openai.com/v1` by default). Token usage comes from
//! the upstream `usage` block when present; cost is computed from a
//! per-model pricing table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;
use tracing::info;

use super::{
    classify_error, sse::SseDecoder, truncate_prompt, ChunkStream, GenerationParams, ModelAdapter,
};
use crate::config::OpenAiSettings;
use crate::health::BackendHealth;
use crate::registry::BackendDescriptor;
use crate::types::{RequestMetadata, ResponseEnvelope, StreamChunk, StreamInit, TokenUsage};

/// Default upstream when no base URL is configured.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Adapter for the hosted OpenAI-like provider.
pub struct OpenAiAdapter {
    descriptor: Arc<BackendDescriptor>,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    bpe: CoreBPE,
}

impl OpenAiAdapter {
    pub fn new(descriptor: Arc<BackendDescriptor>, config: &OpenAiSettings) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            // Panics on invalid header bytes — surfaces misconfiguration at
            // startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {key}"))
                    .expect("API key contains invalid Authorization header characters"),
            );
        }
        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                header::HeaderValue::from_str(org)
                    .expect("organization id contains invalid header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        info!(model = %config.model, "initialized openai adapter");

        Self {
            descriptor,
            client,
            stream_client,
            base_url,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into()),
            bpe: tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer always loads"),
        }
    }

    fn request_body(&self, prompt: &str, params: GenerationParams, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": prompt },
            ],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        })
    }

    async fn chat_completions(&self, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;

        if !status.is_success() {
            anyhow::bail!("backend returned HTTP {status}: {text}");
        }

        serde_json::from_str(&text)
            .with_context(|| format!("parsing backend response as JSON: {text}"))
    }

    fn usage_from(&self, parsed: &Value, prompt: &str, response_text: &str) -> TokenUsage {
        match parsed.get("usage") {
            Some(usage) if usage.is_object() => TokenUsage::new(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                usage["completion_tokens"].as_u64().unwrap_or(0),
            ),
            _ => TokenUsage::estimated(
                self.estimate_tokens(prompt),
                self.estimate_tokens(response_text),
            ),
        }
    }

    /// Cost in USD from the per-1k-token pricing table, keyed by model id.
    fn cost(&self, usage: &TokenUsage) -> f64 {
        let (input, output) = match self.model.as_str() {
            "gpt-4o" => (0.005, 0.015),
            "gpt-4" => (0.03, 0.06),
            "gpt-4-turbo" => (0.01, 0.03),
            "gpt-3.5-turbo" => (0.0005, 0.0015),
            _ => (0.005, 0.015),
        };
        let cost = usage.prompt_tokens as f64 / 1000.0 * input
            + usage.completion_tokens as f64 / 1000.0 * output;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    async fn generate(&self, prompt: &str, metadata: &RequestMetadata) -> ResponseEnvelope {
        let start = Instant::now();
        let prompt = truncate_prompt(prompt, self.descriptor.max_prompt_length);
        let params = GenerationParams::resolve(
            &self.descriptor,
            self.temperature,
            self.max_tokens,
            metadata,
        );

        let body = self.request_body(&prompt, params, false);
        match self.chat_completions(&body).await {
            Ok(parsed) => {
                let text = parsed["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let usage = self.usage_from(&parsed, &prompt, &text);

                let mut envelope = ResponseEnvelope::success(
                    &self.descriptor.key,
                    &self.model,
                    text,
                    start.elapsed().as_millis() as u64,
                );
                envelope.cost = Some(self.cost(&usage));
                envelope.token_usage = Some(usage);
                envelope.finish_reason = parsed["choices"][0]["finish_reason"]
                    .as_str()
                    .map(String::from);
                envelope
            }
            Err(e) => {
                let message = e.to_string();
                ResponseEnvelope::failure(
                    &self.descriptor.key,
                    classify_error(&message),
                    message,
                    start.elapsed().as_millis() as u64,
                )
            }
        }
    }

    async fn stream(
        &self,
        prompt: &str,
        metadata: &RequestMetadata,
    ) -> anyhow::Result<(StreamInit, ChunkStream)> {
        let start = Instant::now();
        let prompt = truncate_prompt(prompt, self.descriptor.max_prompt_length);
        let params = GenerationParams::resolve(
            &self.descriptor,
            self.temperature,
            self.max_tokens,
            metadata,
        );
        let body = self.request_body(&prompt, params, true);

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("backend returned HTTP {status}: {text}");
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            let mut first_chunk_at: Option<u64> = None;
            let mut accumulated = String::new();

            while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        for value in decoder.decode(&chunk) {
                            let delta = value["choices"][0]["delta"]["content"]
                                .as_str()
                                .unwrap_or_default();
                            if delta.is_empty() {
                                continue;
                            }
                            let elapsed = start.elapsed().as_millis() as u64;
                            let ttfc = if first_chunk_at.is_none() {
                                first_chunk_at = Some(elapsed);
                                first_chunk_at
                            } else {
                                None
                            };
                            accumulated.push_str(delta);
                            yield StreamChunk {
                                chunk: delta.to_string(),
                                done: false,
                                latency_ms: elapsed,
                                time_to_first_chunk_ms: ttfc,
                                ..StreamChunk::default()
                            };
                        }
                    }
                    Err(e) => {
                        // Terminate with a single error chunk; note any
                        // partially delivered text so the caller can tell a
                        // clean failure from a truncated answer.
                        let note = if accumulated.is_empty() {
                            format!("Error: {e}")
                        } else {
                            let head: String = accumulated.chars().take(100).collect();
                            format!(
                                "\n\nNote: stream was interrupted. Partial response: {head}..."
                            )
                        };
                        yield StreamChunk {
                            chunk: note,
                            done: true,
                            latency_ms: start.elapsed().as_millis() as u64,
                            error: true,
                            error_details: Some(e.to_string()),
                            partial_response: !accumulated.is_empty(),
                            ..StreamChunk::default()
                        };
                        return;
                    }
                }
            }

            yield StreamChunk {
                done: true,
                latency_ms: start.elapsed().as_millis() as u64,
                ..StreamChunk::default()
            };
        };

        Ok((
            StreamInit {
                model_id: self.model.clone(),
                provider: self.descriptor.provider.clone(),
            },
            Box::pin(stream),
        ))
    }

    /// Probe the backend with `GET /models` — cheaper than an inference call.
    async fn health_probe(&self) -> BackendHealth {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                BackendHealth::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(response) => BackendHealth::unhealthy(format!(
                "health check returned HTTP {}",
                response.status()
            )),
            Err(e) => BackendHealth::unhealthy(format!("health check failed: {e}")),
        }
    }

    fn estimate_tokens(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::registry::build_registry;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> OpenAiAdapter {
        let settings = Settings::default();
        let registry = build_registry(&settings);
        let config = OpenAiSettings {
            api_key: Some("sk-test".into()),
            base_url: Some(server.uri()),
            timeout: 5.0,
            ..settings.openai.clone()
        };
        OpenAiAdapter::new(Arc::clone(registry.get("openai").unwrap()), &config)
    }

    fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20 },
        })
    }

    #[tokio::test]
    async fn generate_returns_text_usage_and_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Answer.")))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let envelope = adapter.generate("question", &RequestMetadata::default()).await;

        assert!(!envelope.error, "unexpected error: {:?}", envelope.error_details);
        assert_eq!(envelope.response, "Answer.");
        assert_eq!(envelope.model_used, "openai");
        assert_eq!(envelope.model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(envelope.finish_reason.as_deref(), Some("stop"));

        let usage = envelope.token_usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 8);
        assert!(!usage.estimated);

        // 12/1000*0.005 + 8/1000*0.015 = 0.00018
        assert!((envelope.cost.unwrap() - 0.00018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn generate_estimates_usage_when_upstream_omits_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "ok" } }],
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let envelope = adapter.generate("hello world", &RequestMetadata::default()).await;
        let usage = envelope.token_usage.unwrap();
        assert!(usage.estimated);
        assert!(usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn rate_limited_upstream_maps_to_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let envelope = adapter.generate("q", &RequestMetadata::default()).await;
        assert!(envelope.error);
        assert_eq!(envelope.error_type.as_deref(), Some("rate_limit"));
        assert!(envelope.response.starts_with("Error:"));
    }

    #[tokio::test]
    async fn server_error_maps_to_server_error_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let envelope = adapter.generate("q", &RequestMetadata::default()).await;
        assert!(envelope.error);
        assert_eq!(envelope.error_type.as_deref(), Some("server_error"));
    }

    #[tokio::test]
    async fn metadata_parameters_reach_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "temperature": 0.2, "max_tokens": 99 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let metadata = RequestMetadata {
            temperature: Some(0.2),
            max_tokens: Some(99),
            ..Default::default()
        };
        let envelope = adapter.generate("q", &metadata).await;
        assert!(!envelope.error, "request did not match expected body");
    }

    #[tokio::test]
    async fn streaming_yields_deltas_then_done() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let (init, stream) = adapter
            .stream("q", &RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(init.model_id, "gpt-4o");

        let chunks: Vec<StreamChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk, "Hel");
        assert!(chunks[0].time_to_first_chunk_ms.is_some());
        assert_eq!(chunks[1].chunk, "lo");
        assert!(chunks[1].time_to_first_chunk_ms.is_none());
        assert!(chunks[2].done);
        assert!(!chunks[2].error);
    }

    #[tokio::test]
    async fn streaming_refuses_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        assert!(adapter.stream("q", &RequestMetadata::default()).await.is_err());
    }

    #[tokio::test]
    async fn health_probe_uses_models_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let health = adapter.health_probe().await;
        assert_eq!(health.status, crate::health::HealthStatus::Healthy);
        assert!(health.latency_ms.is_some());
    }

    #[tokio::test]
    async fn health_probe_fails_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let health = adapter.health_probe().await;
        assert_eq!(health.status, crate::health::HealthStatus::Unhealthy);
        assert!(health.error.unwrap().contains("503"));
    }

    #[test]
    fn token_estimation_counts_bpe_tokens() {
        let settings = Settings::default();
        let registry = build_registry(&settings);
        let adapter = OpenAiAdapter::new(
            Arc::clone(registry.get("openai").unwrap()),
            &settings.openai,
        );
        let count = adapter.estimate_tokens("The quick brown fox jumps over the lazy dog.");
        assert!(count >= 8 && count <= 16, "count was {count}");
        assert_eq!(adapter.estimate_tokens(""), 0);
    }
}
