//! Local OpenAI-compatible endpoint adapter (LM Studio, vLLM, LocalAI, ...).
//!
//! Intentionally thin: the wire protocol is the standard `/chat/completions`
//! shape, there is no API key, and cost is always zero. Local servers often
//! omit the `usage` block, so token counts fall back to an adapter-side
//! estimate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt as _;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use super::{
    classify_error, sse::SseDecoder, truncate_prompt, ChunkStream, GenerationParams, ModelAdapter,
};
use crate::config::LocalSettings;
use crate::health::BackendHealth;
use crate::registry::BackendDescriptor;
use crate::types::{RequestMetadata, ResponseEnvelope, StreamChunk, StreamInit, TokenUsage};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Adapter for a locally-hosted OpenAI-compatible server.
pub struct LocalAdapter {
    descriptor: Arc<BackendDescriptor>,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    /// Word/punctuation splitter for token estimation — local servers have
    /// no shared tokenizer, so a lexical approximation stands in.
    token_pattern: Regex,
}

impl LocalAdapter {
    pub fn new(descriptor: Arc<BackendDescriptor>, config: &LocalSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, "initialized local adapter");

        Self {
            descriptor,
            client,
            stream_client,
            base_url,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into()),
            token_pattern: Regex::new(r"\w+|[^\w\s]").expect("token pattern always compiles"),
        }
    }

    fn request_body(&self, prompt: &str, params: GenerationParams, stream: bool) -> Value {
        json!({
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
        let text = response
            .text()
            .await
            .context("reading local backend response body")?;

        if !status.is_success() {
            anyhow::bail!("local backend returned HTTP {status}: {text}");
        }

        serde_json::from_str(&text)
            .with_context(|| format!("parsing local backend response as JSON: {text}"))
    }
}

#[async_trait]
impl ModelAdapter for LocalAdapter {
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

                let usage = match parsed.get("usage") {
                    Some(usage) if usage.is_object() => TokenUsage::new(
                        usage["prompt_tokens"].as_u64().unwrap_or(0),
                        usage["completion_tokens"].as_u64().unwrap_or(0),
                    ),
                    _ => TokenUsage::estimated(
                        self.estimate_tokens(&prompt),
                        self.estimate_tokens(&text),
                    ),
                };

                let model_id = parsed["model"]
                    .as_str()
                    .unwrap_or(&self.descriptor.model_id)
                    .to_string();

                let mut envelope = ResponseEnvelope::success(
                    &self.descriptor.key,
                    &model_id,
                    text,
                    start.elapsed().as_millis() as u64,
                );
                envelope.token_usage = Some(usage);
                envelope.cost = Some(0.0);
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
            anyhow::bail!("local backend returned HTTP {status}: {text}");
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
                model_id: self.descriptor.model_id.clone(),
                provider: self.descriptor.provider.clone(),
            },
            Box::pin(stream),
        ))
    }

    /// Probe the local server with `GET /models`.
    async fn health_probe(&self) -> BackendHealth {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                BackendHealth::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(response) => BackendHealth::unhealthy(format!(
                "local backend health check returned HTTP {}",
                response.status()
            )),
            Err(e) => {
                BackendHealth::unhealthy(format!("local backend connection error: {e}"))
            }
        }
    }

    fn estimate_tokens(&self, text: &str) -> u64 {
        self.token_pattern.find_iter(text).count() as u64
    }
}
