//! Typed routing errors and their HTTP representation.
//!
//! Adapter failures never cross the adapter boundary as errors — they become
//! error-marked envelopes. [`RouteError`] covers the cases the router itself
//! surfaces to the HTTP layer (unknown backend, exhausted fallback, invalid
//! input), each with a canonical status code and a short machine-readable
//! `code` for error bodies.
//!
//! Handlers return `Result<T, AppError>` and propagate with `?`; the
//! [`IntoResponse`] impl renders the standard error body
//! `{detail, timestamp, request_id, code}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::types::unix_timestamp;

/// Errors the router surfaces to callers as typed failures.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Model '{0}' is not available")]
    ModelNotAvailable(String),

    #[error("Request to model '{model}' timed out after {timeout_secs} seconds")]
    ModelTimeout { model: String, timeout_secs: f64 },

    #[error("Rate limit exceeded for model '{0}'")]
    ModelRateLimit(String),

    #[error("Authentication failed for model '{0}'")]
    ModelAuthentication(String),

    #[error("Prompt exceeds token limit for model '{0}'")]
    ModelTokenLimit(String),

    #[error("Content was filtered by model '{0}'")]
    ModelContentFilter(String),

    #[error("Network connectivity issue when connecting to model provider: {0}")]
    Network(String),

    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("All models failed to process the prompt: {0}")]
    AllModelsFailed(String),
}

impl RouteError {
    /// Canonical HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ModelNotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ModelTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ModelRateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelAuthentication(_) => StatusCode::UNAUTHORIZED,
            Self::ModelTokenLimit(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ModelContentFilter(_) => StatusCode::BAD_REQUEST,
            Self::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidPrompt(_) => StatusCode::BAD_REQUEST,
            Self::AllModelsFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotAvailable(_) => "model_unavailable",
            Self::ModelTimeout { .. } => "request_timeout",
            Self::ModelRateLimit(_) => "rate_limit",
            Self::ModelAuthentication(_) => "authentication_failed",
            Self::ModelTokenLimit(_) => "token_limit",
            Self::ModelContentFilter(_) => "content_filtered",
            Self::Network(_) => "network_error",
            Self::InvalidPrompt(_) => "invalid_prompt",
            Self::AllModelsFailed(_) => "all_models_failed",
        }
    }
}

/// Handler-level error wrapper carrying an optional request id.
///
/// Typed [`RouteError`]s keep their status mapping; anything else becomes a
/// 500 with code `internal_error`.
#[derive(Debug)]
pub struct AppError {
    error: anyhow::Error,
    request_id: Option<String>,
}

impl AppError {
    /// Attach the request id so error bodies echo it.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self.error.downcast_ref::<RouteError>() {
            Some(route_err) => (route_err.status(), route_err.code()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        tracing::warn!(
            error = %self.error,
            status = status.as_u16(),
            request_id = self.request_id.as_deref().unwrap_or("unknown"),
            "handler error"
        );

        (
            status,
            Json(json!({
                "detail": self.error.to_string(),
                "timestamp": unix_timestamp(),
                "request_id": self.request_id,
                "code": code,
            })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self { error: e.into(), request_id: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_error_kinds() {
        assert_eq!(
            RouteError::ModelNotAvailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RouteError::ModelTimeout { model: "x".into(), timeout_secs: 1.0 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RouteError::ModelRateLimit("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RouteError::ModelAuthentication("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RouteError::ModelTokenLimit("x".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            RouteError::ModelContentFilter("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RouteError::Network("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            RouteError::InvalidPrompt("empty".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RouteError::AllModelsFailed("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable_identifiers() {
        assert_eq!(RouteError::AllModelsFailed("x".into()).code(), "all_models_failed");
        assert_eq!(RouteError::ModelNotAvailable("x".into()).code(), "model_unavailable");
        assert_eq!(
            RouteError::ModelTimeout { model: "x".into(), timeout_secs: 2.0 }.code(),
            "request_timeout"
        );
    }

    #[tokio::test]
    async fn app_error_renders_standard_body() {
        let err: AppError = anyhow::Error::from(RouteError::ModelNotAvailable("gpt".into()))
            .into();
        let response = err.with_request_id("req_test_1").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "model_unavailable");
        assert_eq!(body["request_id"], "req_test_1");
        assert!(body["detail"].as_str().unwrap().contains("gpt"));
        assert!(body["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn untyped_errors_become_internal_error() {
        let err: AppError = anyhow::anyhow!("boom").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "internal_error");
    }
}
