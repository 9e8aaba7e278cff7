//! Request handlers.
//!
//! | Method & path | Purpose |
//! |---|---|
//! | `POST /prompt` | Route a prompt (SSE response when streaming) |
//! | `POST /test-model/{backend}` | Call one backend directly |
//! | `GET /health?detailed=` | Aggregate gateway + model health |
//! | `GET /healthz` | Bare liveness probe |
//! | `GET /models?include_health=` | Enumerate the registry |
//! | `GET /models/capabilities` | Capability → backends mapping |
//! | `GET /models/{backend}/health` | One backend's health + metrics |
//! | `POST /admin/cache/clear?model=` | Invalidate cached responses |
//! | `GET /admin/requests?limit=` | Recent prompt-log entries |
//!
//! Error bodies are always `{detail, timestamp, request_id, code}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::json;

use super::request_id::RequestId;
use crate::error::{AppError, RouteError};
use crate::router::{ModelRouter, RouteReply, StreamingResponse};
use crate::types::{unix_timestamp, RequestMetadata, ResponseEnvelope};

/// Build the public axum router.
pub fn router(state: Arc<ModelRouter>) -> Router {
    Router::new()
        .route("/prompt", post(process_prompt))
        .route("/test-model/{backend}", post(test_model))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/models", get(list_models))
        .route("/models/capabilities", get(model_capabilities))
        .route("/models/{backend}/health", get(model_health))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/requests", get(recent_requests))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

/// `POST /prompt` — route a prompt to the best-suited backend.
async fn process_prompt(
    State(router): State<Arc<ModelRouter>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<PromptRequest>,
) -> Response {
    let mut metadata = request.metadata.unwrap_or_default();
    if metadata.request_id.is_none() {
        metadata.request_id = Some(request_id);
    }

    match router.route(&request.prompt, metadata).await {
        RouteReply::Envelope(envelope) if envelope.error => error_response(&envelope),
        RouteReply::Envelope(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        RouteReply::Stream(streaming) => sse_response(streaming),
    }
}

/// `POST /test-model/{backend}` — bypass classifier and cache.
async fn test_model(
    State(router): State<Arc<ModelRouter>>,
    Path(backend): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<PromptRequest>,
) -> Response {
    let mut metadata = request.metadata.unwrap_or_default();
    if metadata.request_id.is_none() {
        metadata.request_id = Some(request_id.clone());
    }

    match router.test_model(&backend, &request.prompt, metadata).await {
        Ok(RouteReply::Envelope(envelope)) if envelope.error => error_response(&envelope),
        Ok(RouteReply::Envelope(envelope)) => (StatusCode::OK, Json(envelope)).into_response(),
        Ok(RouteReply::Stream(streaming)) => sse_response(streaming),
        Err(RouteError::ModelNotAvailable(name)) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "detail": format!("Model '{name}' not found"),
                "timestamp": unix_timestamp(),
                "request_id": request_id,
                "code": "model_not_found",
            })),
        )
            .into_response(),
        Err(other) => AppError::from(anyhow::Error::from(other))
            .with_request_id(request_id)
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct HealthQuery {
    #[serde(default)]
    detailed: bool,
}

/// `GET /health` — aggregate status derived from per-backend health.
async fn health(
    State(router): State<Arc<ModelRouter>>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    let report = router.health_report();
    let mut body = json!({
        "status": report.status,
        "message": report.message,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": router.started_at.elapsed().as_secs_f64(),
        "timestamp": unix_timestamp(),
        "models": report.models,
    });
    if query.detailed {
        body["metrics"] = serde_json::to_value(&report.metrics).unwrap_or_default();
    }
    Json(body)
}

/// `GET /healthz` — liveness probe with no dependencies; never blocks.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[derive(Debug, Default, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    include_health: bool,
}

/// `GET /models` — enumerate registered backends.
async fn list_models(
    State(router): State<Arc<ModelRouter>>,
    Query(query): Query<ModelsQuery>,
) -> impl IntoResponse {
    let models = router.available_models(query.include_health);
    Json(json!({
        "models": models,
        "count": models.len(),
        "timestamp": unix_timestamp(),
    }))
}

/// `GET /models/capabilities` — capability tag → supporting backends.
async fn model_capabilities(State(router): State<Arc<ModelRouter>>) -> impl IntoResponse {
    let registry = router.registry();

    let capabilities: serde_json::Map<String, serde_json::Value> = registry
        .capability_index()
        .iter()
        .map(|(capability, backends)| (capability.to_string(), json!(backends)))
        .collect();

    let models: serde_json::Map<String, serde_json::Value> = registry
        .descriptors()
        .map(|d| (d.key.clone(), json!(d.name)))
        .collect();

    Json(json!({
        "capabilities": capabilities,
        "models": models,
        "timestamp": unix_timestamp(),
    }))
}

/// `GET /models/{backend}/health` — one backend's health and metrics.
async fn model_health(
    State(router): State<Arc<ModelRouter>>,
    Path(backend): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    let report = router.health_report();
    match report.models.get(&backend) {
        Some(health) => Json(json!({
            "model": backend,
            "health": health,
            "metrics": report.metrics.get(&backend),
            "timestamp": unix_timestamp(),
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "detail": format!("Model '{backend}' not found"),
                "timestamp": unix_timestamp(),
                "request_id": request_id,
                "code": "model_not_found",
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClearCacheQuery {
    #[serde(default)]
    model: Option<String>,
}

/// `POST /admin/cache/clear` — drop cached responses, optionally per model.
async fn clear_cache(
    State(router): State<Arc<ModelRouter>>,
    Query(query): Query<ClearCacheQuery>,
) -> impl IntoResponse {
    let cleared = router.cache().clear(query.model.as_deref()).await;
    Json(json!({
        "success": true,
        "cleared_entries": cleared,
        "model": query.model,
        "timestamp": unix_timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    #[serde(default = "default_requests_limit")]
    limit: usize,
}

fn default_requests_limit() -> usize {
    100
}

/// `GET /admin/requests?limit=N` — recent prompt-log entries plus aggregates.
async fn recent_requests(
    State(router): State<Arc<ModelRouter>>,
    Query(query): Query<RequestsQuery>,
) -> impl IntoResponse {
    let entries = router.prompt_log.recent(query.limit).await;
    let stats = router.prompt_log.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// Render an error envelope as the standard error body with its mapped
/// status code.
fn error_response(envelope: &ResponseEnvelope) -> Response {
    let code = envelope.error_type.as_deref().unwrap_or("unknown");
    (
        status_for_error_type(code),
        Json(json!({
            "detail": envelope.response,
            "timestamp": envelope.timestamp.unwrap_or_else(unix_timestamp),
            "request_id": envelope.request_id,
            "code": code,
        })),
    )
        .into_response()
}

fn status_for_error_type(error_type: &str) -> StatusCode {
    match error_type {
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "model_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "all_models_failed" => StatusCode::INTERNAL_SERVER_ERROR,
        "invalid_prompt" | "bad_request" | "content_filter" => StatusCode::BAD_REQUEST,
        "rate_limit" => StatusCode::TOO_MANY_REQUESTS,
        "authentication" => StatusCode::UNAUTHORIZED,
        "token_limit" => StatusCode::PAYLOAD_TOO_LARGE,
        "connection" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn an initialized stream into a Server-Sent Events response.
///
/// The first event carries the initialization metadata; every subsequent
/// event is one serialized [`crate::types::StreamChunk`], ending with the
/// terminal `done` chunk.
fn sse_response(streaming: StreamingResponse) -> Response {
    let StreamingResponse {
        model_used,
        model_id,
        request_id,
        init_latency_ms,
        fallback,
        fallback_reason,
        classification,
        test_mode,
        stream,
    } = streaming;

    let init = json!({
        "model_used": model_used,
        "model_id": model_id,
        "request_id": request_id,
        "stream": true,
        "init_latency_ms": init_latency_ms,
        "fallback": fallback,
        "fallback_reason": fallback_reason,
        "classification": classification,
        "test_mode": test_mode,
    });

    let head = futures_util::stream::once(async move {
        Ok::<_, Infallible>(Bytes::from(format!("data: {init}\n\n")))
    });
    let chunks = stream.map(|chunk| {
        let payload = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".into());
        Ok::<_, Infallible>(Bytes::from(format!("data: {payload}\n\n")))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(head.chain(chunks)))
        .expect("static response parts are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockAdapter;
    use crate::backends::ModelAdapter;
    use crate::cache::ResponseCache;
    use crate::classifier::PromptClassifier;
    use crate::config::Settings;
    use crate::promptlog::PromptLog;
    use crate::registry::build_registry;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_state(failing: bool) -> Arc<ModelRouter> {
        let settings = Arc::new(Settings::default());
        let registry = Arc::new(build_registry(&settings));

        let mut adapters: HashMap<String, Arc<dyn ModelAdapter>> = HashMap::new();
        for key in ["local", "openai", "anthropic"] {
            let descriptor = Arc::clone(registry.get(key).unwrap());
            let adapter: Arc<dyn ModelAdapter> = if failing {
                Arc::new(MockAdapter::failing(descriptor, "server_error", "boom"))
            } else {
                Arc::new(MockAdapter::responding(descriptor, "mock answer"))
            };
            adapters.insert(key.to_string(), adapter);
        }

        let classifier = Arc::new(PromptClassifier::new(
            Arc::clone(&registry),
            settings.default_backend(),
        ));
        Arc::new(ModelRouter::new(
            settings,
            registry,
            classifier,
            Arc::new(ResponseCache::disabled()),
            adapters,
            Arc::new(PromptLog::new(100)),
        ))
    }

    fn app(state: Arc<ModelRouter>) -> Router {
        router(state).layer(axum::middleware::from_fn(
            super::super::request_id::request_id_middleware,
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let response = app(test_state(false)).oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn prompt_returns_envelope_and_request_id_header() {
        let response = app(test_state(false))
            .oneshot(post_json("/prompt", json!({ "prompt": "hello there" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let header_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(header_id.starts_with("req_"));

        let body = body_json(response).await;
        assert_eq!(body["model_used"], "local");
        assert_eq!(body["response"], "mock answer");
        assert_eq!(body["request_id"], header_id.as_str());
    }

    #[tokio::test]
    async fn caller_supplied_request_id_is_echoed() {
        let request = Request::builder()
            .method("POST")
            .uri("/prompt")
            .header("content-type", "application/json")
            .header("x-request-id", "req_caller_7")
            .body(Body::from(json!({ "prompt": "hello" }).to_string()))
            .unwrap();

        let response = app(test_state(false)).oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "req_caller_7"
        );
        let body = body_json(response).await;
        assert_eq!(body["request_id"], "req_caller_7");
    }

    #[tokio::test]
    async fn empty_prompt_maps_to_bad_request() {
        let response = app(test_state(false))
            .oneshot(post_json("/prompt", json!({ "prompt": "   " })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "invalid_prompt");
        assert!(body["detail"].as_str().unwrap().contains("empty"));
        assert!(body["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn exhausted_fallback_maps_to_internal_error() {
        let response = app(test_state(true))
            .oneshot(post_json("/prompt", json!({ "prompt": "hello there" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["code"], "all_models_failed");
    }

    #[tokio::test]
    async fn test_model_hits_named_backend_only() {
        let response = app(test_state(false))
            .oneshot(post_json("/test-model/anthropic", json!({ "prompt": "ping" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["model_used"], "anthropic");
        assert_eq!(body["test_mode"], true);
    }

    #[tokio::test]
    async fn unknown_test_model_is_404() {
        let response = app(test_state(false))
            .oneshot(post_json("/test-model/mystery", json!({ "prompt": "ping" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "model_not_found");
    }

    #[tokio::test]
    async fn models_endpoint_enumerates_registry() {
        let response = app(test_state(false)).oneshot(get("/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["count"], 3);
        let ids: Vec<&str> = body["models"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["local", "openai", "anthropic"]);
        // Health omitted unless requested.
        assert!(body["models"][0].get("health").is_none());
    }

    #[tokio::test]
    async fn models_endpoint_includes_health_on_request() {
        let response = app(test_state(false))
            .oneshot(get("/models?include_health=true"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["models"][0]["health"]["status"].is_string());
        assert!(body["models"][0]["metrics"]["requests"].is_u64());
    }

    #[tokio::test]
    async fn capabilities_endpoint_maps_tags_to_backends() {
        let response = app(test_state(false))
            .oneshot(get("/models/capabilities"))
            .await
            .unwrap();
        let body = body_json(response).await;

        let legal = body["capabilities"]["legal_analysis"].as_array().unwrap();
        assert_eq!(legal.len(), 1);
        assert_eq!(legal[0], "anthropic");
        assert_eq!(body["models"]["openai"], "gpt-4o");
    }

    #[tokio::test]
    async fn model_health_endpoint_handles_known_and_unknown() {
        let state = test_state(false);
        let response = app(Arc::clone(&state))
            .oneshot(get("/models/openai/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["model"], "openai");
        assert_eq!(body["health"]["status"], "unknown");

        let response = app(state).oneshot(get("/models/mystery/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_endpoint_reports_aggregate_and_optional_metrics() {
        let response = app(test_state(false)).oneshot(get("/health")).await.unwrap();
        let body = body_json(response).await;
        assert!(body["status"].is_string());
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime_seconds"].is_f64() || body["uptime_seconds"].is_u64());
        assert_eq!(body["models"].as_object().unwrap().len(), 3);
        assert!(body.get("metrics").is_none());

        let response = app(test_state(false))
            .oneshot(get("/health?detailed=true"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["metrics"].is_object());
    }

    #[tokio::test]
    async fn cache_clear_reports_zero_when_disabled() {
        let response = app(test_state(false))
            .oneshot(post_json("/admin/cache/clear?model=openai", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cleared_entries"], 0);
        assert_eq!(body["model"], "openai");
    }

    #[tokio::test]
    async fn recent_requests_exposes_prompt_log() {
        let state = test_state(false);
        app(Arc::clone(&state))
            .oneshot(post_json("/prompt", json!({ "prompt": "hello there" })))
            .await
            .unwrap();

        let response = app(state).oneshot(get("/admin/requests?limit=5")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["stats"]["total_requests"], 1);
        assert_eq!(body["entries"][0]["model_used"], "local");
    }

    #[tokio::test]
    async fn streaming_prompt_returns_event_stream() {
        let request = post_json(
            "/prompt",
            json!({ "prompt": "hello", "metadata": { "model": "local", "stream": true } }),
        );
        let response = app(test_state(false)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<&str> = text
            .split("\n\n")
            .filter(|e| !e.trim().is_empty())
            .collect();
        // init + content chunk + terminal done chunk
        assert_eq!(events.len(), 3);
        assert!(events[0].contains("\"stream\":true"));
        assert!(events[1].contains("mock answer"));
        assert!(events[2].contains("\"done\":true"));
    }
}
