use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod backends;
mod cache;
mod classifier;
mod config;
mod error;
mod health;
mod keystore;
mod metrics;
mod promptlog;
mod registry;
mod router;
mod types;

pub use config::Settings;
pub use error::AppError;

/// Prompt-log ring buffer capacity.
const PROMPT_LOG_CAPACITY: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Load config before tracing so the log level/format can come from it.
    let config_path = std::env::var("PROMPTGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    let settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_tracing(&settings);
    info!(port = settings.server.port, "promptgate starting");

    // Provider credential store — active records override config credentials.
    let keystore = match &settings.keystore.path {
        Some(path) => keystore::ProviderKeyStore::load(std::path::Path::new(path))?,
        None => keystore::ProviderKeyStore::empty(),
    };

    // Assemble the routing core: registry → classifier → cache → adapters.
    let settings = Arc::new(settings);
    let registry = Arc::new(registry::build_registry(&settings));
    let classifier = Arc::new(classifier::PromptClassifier::new(
        Arc::clone(&registry),
        settings.default_backend(),
    ));
    let response_cache = Arc::new(cache::ResponseCache::connect(settings.cache.clone()).await);
    let adapters = backends::build_adapters(&settings, &registry, &keystore);

    let model_router = Arc::new(router::ModelRouter::new(
        Arc::clone(&settings),
        registry,
        classifier,
        response_cache,
        adapters,
        Arc::new(promptlog::PromptLog::new(PROMPT_LOG_CAPACITY)),
    ));
    model_router.spawn_health_loop();

    let app = api::routes::router(Arc::clone(&model_router))
        .layer(axum::middleware::from_fn(
            api::request_id::request_id_middleware,
        ))
        .layer(cors_layer(&settings))
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.server.port).parse()?;
    info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("shutting down");
    model_router.close().await;

    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| settings.log.level.clone().into());

    if settings.log.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cors_layer(settings: &Settings) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    if settings.api.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = settings
            .api
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `promptgate --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8000);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
