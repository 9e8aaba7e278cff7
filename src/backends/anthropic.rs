//! Hosted Anthropic-compatible adapter (Messages API).
//!
//! Protocol differences handled here, relative to the OpenAI-style adapters:
//!
//! | Concern | OpenAI-style | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional | **Required** (`max_tokens`) |
//! | Response shape | `choices[].message.content` | `content[].text` blocks |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |
//! | Stream deltas | `choices[].delta.content` | `content_block_delta` events |

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
use crate::config::AnthropicSettings;
use crate::health::BackendHealth;
use crate::registry::BackendDescriptor;
use crate::types::{RequestMetadata, ResponseEnvelope, StreamChunk, StreamInit, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Adapter for the hosted Anthropic-like provider.
pub struct AnthropicAdapter {
    descriptor: Arc<BackendDescriptor>,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    bpe: CoreBPE,
}

impl AnthropicAdapter {
    pub fn new(descriptor: Arc<BackendDescriptor>, config: &AnthropicSettings) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                "x-api-key",
                header::HeaderValue::from_str(key)
                    .expect("Anthropic API key contains invalid header characters"),
            );
        }
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );

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

        info!(model = %config.model, "initialized anthropic adapter");

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
            // Claude tokenizes similarly enough to cl100k_base for estimates.
            bpe: tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer always loads"),
        }
    }

    fn request_body(&self, prompt: &str, params: GenerationParams, stream: bool) -> Value {
        json!({
            "model": self.model,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "system": self.system_prompt,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        })
    }

    async fn messages(&self, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/messages", self.base_url);
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
            .context("reading Anthropic response body")?;

        if !status.is_success() {
            anyhow::bail!("Anthropic returned HTTP {status}: {text}");
        }

        serde_json::from_str(&text)
            .with_context(|| format!("parsing Anthropic response as JSON: {text}"))
    }

    /// Cost in USD from the per-1M-token pricing table, keyed by model id.
    fn cost(&self, usage: &TokenUsage) -> f64 {
        let (input, output) = match self.model.as_str() {
            "claude-3-opus-20240229" => (15.0, 75.0),
            "claude-3-sonnet-20240229" => (3.0, 15.0),
            "claude-3-haiku-20240307" => (0.25, 1.25),
            "claude-2.1" | "claude-2.0" => (8.0, 24.0),
            "claude-instant-1.2" => (0.8, 2.4),
            _ => (3.0, 15.0),
        };
        let cost = usage.prompt_tokens as f64 * input / 1_000_000.0
            + usage.completion_tokens as f64 * output / 1_000_000.0;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
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
        match self.messages(&body).await {
            Ok(parsed) => {
                // Responses carry a `content` array of typed blocks; collect
                // every text block, ignoring tool_use and friends.
                let text: String = parsed["content"]
                    .as_array()
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter(|b| b["type"] == "text")
                            .filter_map(|b| b["text"].as_str())
                            .collect()
                    })
                    .unwrap_or_default();

                let usage = TokenUsage::new(
                    parsed["usage"]["input_tokens"].as_u64().unwrap_or(0),
                    parsed["usage"]["output_tokens"].as_u64().unwrap_or(0),
                );

                let mut envelope = ResponseEnvelope::success(
                    &self.descriptor.key,
                    &self.model,
                    text,
                    start.elapsed().as_millis() as u64,
                );
                envelope.cost = Some(self.cost(&usage));
                envelope.token_usage = Some(usage);
                envelope.finish_reason =
                    parsed["stop_reason"].as_str().map(String::from);
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

        let url = format!("{}/messages", self.base_url);
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
            anyhow::bail!("Anthropic returned HTTP {status}: {text}");
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
                            // Text arrives in content_block_delta events.
                            let delta = match value["type"].as_str() {
                                Some("content_block_delta") => {
                                    value["delta"]["text"].as_str().unwrap_or_default()
                                }
                                _ => "",
                            };
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
                model_id: self.model.clone(),
                provider: self.descriptor.provider.clone(),
            },
            Box::pin(stream),
        ))
    }

    /// Probe with a minimal 1-token message.
    ///
    /// There is no cheap unauthenticated endpoint on the Messages API, so a
    /// tiny inference call is the only reliable way to verify auth and
    /// connectivity.
    async fn health_probe(&self) -> BackendHealth {
        let start = Instant::now();
        let probe = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });

        let url = format!("{}/messages", self.base_url);
        match self.client.post(&url).json(&probe).send().await {
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
