//! Configuration for promptgate.
//!
//! Settings are loaded once at startup from a TOML file, overlaid with
//! environment variables using a `__` nested delimiter (`CACHE__TTL`,
//! `OPENAI__API_KEY`), and validated before the server opens any ports.
//! Invalid configs are rejected with a clear error rather than silently
//! falling back to defaults.
//!
//! # Example
//! ```toml
//! [cache]
//! enabled = true
//! host    = "localhost"
//! ttl     = 600
//!
//! [api]
//! default_model = "openai"
//!
//! [fallback]
//! max_retries = 2
//!
//! [openai]
//! api_key = "sk-..."
//! model   = "gpt-4o"
//! ```

use std::{collections::HashMap, path::Path, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level application settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub fallback: FallbackSettings,

    #[serde(default)]
    pub local: LocalSettings,

    #[serde(default)]
    pub openai: OpenAiSettings,

    #[serde(default)]
    pub anthropic: AnthropicSettings,

    #[serde(default)]
    pub keystore: KeystoreSettings,
}

impl Settings {
    /// Load settings from a TOML file (when present), overlay environment
    /// variables, and validate. A missing file is not an error — everything
    /// can be driven from the environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).context("parsing config TOML")?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay `SECTION__FIELD` environment variables onto the parsed config.
    ///
    /// Only recognized fields are consulted; unparseable values are ignored
    /// with a warning so a bad `CACHE__PORT=abc` cannot take the gateway down.
    pub fn apply_env_overrides(&mut self) {
        env_set(&mut self.server.port, "SERVER__PORT");
        env_set(&mut self.server.port, "PORT");

        env_set(&mut self.log.level, "LOG__LEVEL");
        env_set(&mut self.log.format, "LOG__FORMAT");
        env_set(&mut self.log.dir, "LOG__DIR");

        env_set(&mut self.cache.enabled, "CACHE__ENABLED");
        env_set(&mut self.cache.host, "CACHE__HOST");
        env_set(&mut self.cache.port, "CACHE__PORT");
        env_set(&mut self.cache.db, "CACHE__DB");
        env_set_opt(&mut self.cache.password, "CACHE__PASSWORD");
        env_set(&mut self.cache.ttl, "CACHE__TTL");
        env_set(&mut self.cache.key_prefix, "CACHE__KEY_PREFIX");
        env_set(&mut self.cache.timeout, "CACHE__TIMEOUT");
        env_set(&mut self.cache.connect_timeout, "CACHE__CONNECT_TIMEOUT");
        env_set(&mut self.cache.max_retries, "CACHE__MAX_RETRIES");
        env_set(&mut self.cache.reconnect_delay, "CACHE__RECONNECT_DELAY");

        env_set(&mut self.api.default_request_timeout, "API__DEFAULT_REQUEST_TIMEOUT");
        env_set(&mut self.api.max_prompt_length, "API__MAX_PROMPT_LENGTH");
        env_set(&mut self.api.health_check_interval, "API__HEALTH_CHECK_INTERVAL");
        env_set(&mut self.api.default_model, "API__DEFAULT_MODEL");
        env_set(&mut self.api.enable_health_checks, "API__ENABLE_HEALTH_CHECKS");
        if let Ok(origins) = std::env::var("API__CORS_ORIGINS") {
            self.api.cors_origins = origins.split(',').map(|s| s.trim().to_string()).collect();
        }

        env_set(&mut self.fallback.enabled, "FALLBACK__ENABLED");
        env_set(&mut self.fallback.max_retries, "FALLBACK__MAX_RETRIES");
        env_set(&mut self.fallback.retry_on_timeout, "FALLBACK__RETRY_ON_TIMEOUT");
        env_set(&mut self.fallback.retry_on_rate_limit, "FALLBACK__RETRY_ON_RATE_LIMIT");
        env_set(&mut self.fallback.retry_on_server_error, "FALLBACK__RETRY_ON_SERVER_ERROR");

        env_set(&mut self.local.base_url, "LOCAL__BASE_URL");
        env_set(&mut self.local.model, "LOCAL__MODEL");
        env_set(&mut self.local.temperature, "LOCAL__TEMPERATURE");
        env_set(&mut self.local.max_tokens, "LOCAL__MAX_TOKENS");
        env_set(&mut self.local.timeout, "LOCAL__TIMEOUT");
        env_set_opt(&mut self.local.system_prompt, "LOCAL__SYSTEM_PROMPT");

        env_set_opt(&mut self.openai.api_key, "OPENAI__API_KEY");
        env_set(&mut self.openai.model, "OPENAI__MODEL");
        env_set_opt(&mut self.openai.organization, "OPENAI__ORGANIZATION");
        env_set_opt(&mut self.openai.base_url, "OPENAI__BASE_URL");
        env_set(&mut self.openai.temperature, "OPENAI__TEMPERATURE");
        env_set(&mut self.openai.max_tokens, "OPENAI__MAX_TOKENS");
        env_set(&mut self.openai.timeout, "OPENAI__TIMEOUT");
        env_set_opt(&mut self.openai.system_prompt, "OPENAI__SYSTEM_PROMPT");

        env_set_opt(&mut self.anthropic.api_key, "ANTHROPIC__API_KEY");
        env_set(&mut self.anthropic.model, "ANTHROPIC__MODEL");
        env_set_opt(&mut self.anthropic.base_url, "ANTHROPIC__BASE_URL");
        env_set(&mut self.anthropic.temperature, "ANTHROPIC__TEMPERATURE");
        env_set(&mut self.anthropic.max_tokens, "ANTHROPIC__MAX_TOKENS");
        env_set(&mut self.anthropic.timeout, "ANTHROPIC__TIMEOUT");
        env_set_opt(&mut self.anthropic.system_prompt, "ANTHROPIC__SYSTEM_PROMPT");

        env_set_opt(&mut self.keystore.path, "KEYSTORE__PATH");
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.cache.ttl > 0, "cache.ttl must be positive");
        anyhow::ensure!(
            self.api.default_request_timeout > 0.0,
            "api.default_request_timeout must be positive"
        );
        anyhow::ensure!(
            self.api.max_prompt_length > 0,
            "api.max_prompt_length must be positive"
        );

        let known = ["local", "openai", "anthropic"];
        if self.api.default_model != "auto" {
            anyhow::ensure!(
                known.contains(&self.api.default_model.as_str()),
                "api.default_model `{}` is not a known backend",
                self.api.default_model
            );
        }

        // Every fallback_order entry must reference known backends only.
        for (primary, order) in &self.fallback.fallback_order {
            anyhow::ensure!(
                known.contains(&primary.as_str()),
                "fallback_order key `{primary}` is not a known backend"
            );
            for target in order {
                anyhow::ensure!(
                    known.contains(&target.as_str()),
                    "fallback_order for `{primary}` references unknown backend `{target}`"
                );
            }
        }

        for (name, t) in [
            ("local", self.local.temperature),
            ("openai", self.openai.temperature),
            ("anthropic", self.anthropic.temperature),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&t),
                "{name}.temperature must be within [0.0, 1.0]"
            );
        }

        Ok(())
    }

    /// The default backend used when scoring produces no clear winner.
    ///
    /// `"auto"` means the built-in default (`openai`).
    pub fn default_backend(&self) -> &str {
        match self.api.default_model.as_str() {
            "auto" => "openai",
            other => other,
        }
    }

    /// Fallback order for a primary backend. The configured map is
    /// authoritative; missing entries use the built-in preference order with
    /// the primary moved out of the way.
    pub fn fallback_order(&self, primary: &str) -> Vec<String> {
        if let Some(order) = self.fallback.fallback_order.get(primary) {
            return order.clone();
        }
        ["openai", "anthropic", "local"]
            .iter()
            .filter(|k| **k != primary)
            .map(|k| k.to_string())
            .collect()
    }
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Port the HTTP API listens on (default: 8000, or the `PORT` env var).
    #[serde(default = "defaults::port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: defaults::port() }
    }
}

/// Logging settings — level, format and (optional) file directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Default tracing filter (also controlled by `RUST_LOG`).
    #[serde(default = "defaults::log_level")]
    pub level: String,

    /// `"pretty"` or `"json"`.
    #[serde(default = "defaults::log_format")]
    pub format: String,

    /// Directory for log files; empty disables file logging.
    #[serde(default)]
    pub dir: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            format: defaults::log_format(),
            dir: String::new(),
        }
    }
}

/// Response cache (Redis) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "defaults::cache_host")]
    pub host: String,

    #[serde(default = "defaults::cache_port")]
    pub port: u16,

    #[serde(default)]
    pub db: u32,

    #[serde(default)]
    pub password: Option<String>,

    /// Default entry TTL in seconds.
    #[serde(default = "defaults::cache_ttl")]
    pub ttl: u64,

    /// Prefix for every key written by this gateway.
    #[serde(default = "defaults::cache_key_prefix")]
    pub key_prefix: String,

    /// Command timeout in seconds.
    #[serde(default = "defaults::cache_timeout")]
    pub timeout: f64,

    #[serde(default = "defaults::cache_timeout")]
    pub connect_timeout: f64,

    /// Consecutive connection failures before the cache disables itself.
    #[serde(default = "defaults::cache_max_retries")]
    pub max_retries: u32,

    /// Seconds to wait between reconnection attempts.
    #[serde(default = "defaults::cache_reconnect_delay")]
    pub reconnect_delay: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty cache settings always deserialize")
    }
}

impl CacheSettings {
    /// Connection URL in the `redis://` scheme the client expects.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Routing/API behavior settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiSettings {
    #[serde(default = "defaults::cors_origins")]
    pub cors_origins: Vec<String>,

    /// Default per-request deadline in seconds.
    #[serde(default = "defaults::request_timeout")]
    pub default_request_timeout: f64,

    /// Prompts longer than this are truncated before routing.
    #[serde(default = "defaults::max_prompt_length")]
    pub max_prompt_length: usize,

    /// Default health-check interval in seconds for backends that don't set
    /// their own.
    #[serde(default = "defaults::health_check_interval")]
    pub health_check_interval: u64,

    /// Backend selected when scoring is inconclusive (`"auto"` = built-in).
    #[serde(default = "defaults::default_model")]
    pub default_model: String,

    #[serde(default = "defaults::enabled")]
    pub enable_health_checks: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty api settings always deserialize")
    }
}

/// Fallback policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackSettings {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Maximum number of fallback attempts after the primary fails.
    #[serde(default = "defaults::fallback_max_retries")]
    pub max_retries: usize,

    #[serde(default = "defaults::enabled")]
    pub retry_on_timeout: bool,

    #[serde(default = "defaults::enabled")]
    pub retry_on_rate_limit: bool,

    #[serde(default = "defaults::enabled")]
    pub retry_on_server_error: bool,

    /// Ordered fallback targets per primary backend.
    #[serde(default = "defaults::fallback_order")]
    pub fallback_order: HashMap<String, Vec<String>>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty fallback settings always deserialize")
    }
}

/// Local OpenAI-compatible endpoint (LM Studio, vLLM, LocalAI, ...).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalSettings {
    #[serde(default = "defaults::local_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::local_model")]
    pub model: String,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    #[serde(default = "defaults::local_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "defaults::local_timeout")]
    pub timeout: f64,

    #[serde(default = "defaults::retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LocalSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty local settings always deserialize")
    }
}

/// Hosted OpenAI-like provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "defaults::openai_model")]
    pub model: String,

    #[serde(default)]
    pub organization: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    #[serde(default = "defaults::hosted_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "defaults::openai_timeout")]
    pub timeout: f64,

    #[serde(default = "defaults::retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty openai settings always deserialize")
    }
}

/// Hosted Anthropic-like provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicSettings {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "defaults::anthropic_model")]
    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    #[serde(default = "defaults::hosted_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "defaults::anthropic_timeout")]
    pub timeout: f64,

    #[serde(default = "defaults::retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AnthropicSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty anthropic settings always deserialize")
    }
}

/// Provider credential store settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeystoreSettings {
    /// Path to the JSON key/settings table. Unset disables the store.
    #[serde(default)]
    pub path: Option<String>,
}

/// Parse an env var into a field, keeping the existing value on absence or
/// parse failure.
fn env_set<T: FromStr>(field: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse::<T>() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(var, raw, "ignoring unparseable environment override"),
        }
    }
}

/// Parse an env var into an optional field. An empty value clears it.
fn env_set_opt<T: FromStr>(field: &mut Option<T>, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if raw.is_empty() {
            *field = None;
        } else {
            match raw.parse::<T>() {
                Ok(value) => *field = Some(value),
                Err(_) => tracing::warn!(var, raw, "ignoring unparseable environment override"),
            }
        }
    }
}

mod defaults {
    use std::collections::HashMap;

    pub fn port() -> u16 { 8000 }
    pub fn log_level() -> String { "promptgate=info,tower_http=warn".into() }
    pub fn log_format() -> String { "pretty".into() }
    pub fn cache_host() -> String { "localhost".into() }
    pub fn cache_port() -> u16 { 6379 }
    pub fn cache_ttl() -> u64 { 600 }
    pub fn cache_key_prefix() -> String { "promptgate:".into() }
    pub fn cache_timeout() -> f64 { 3.0 }
    pub fn cache_max_retries() -> u32 { 3 }
    pub fn cache_reconnect_delay() -> u64 { 5 }
    pub fn cors_origins() -> Vec<String> { vec!["*".into()] }
    pub fn request_timeout() -> f64 { 60.0 }
    pub fn max_prompt_length() -> usize { 100_000 }
    pub fn health_check_interval() -> u64 { 300 }
    pub fn default_model() -> String { "auto".into() }
    pub fn enabled() -> bool { true }
    pub fn fallback_max_retries() -> usize { 2 }
    pub fn temperature() -> f64 { 0.7 }
    pub fn retry_attempts() -> u32 { 2 }
    pub fn local_base_url() -> String { "http://localhost:1234/v1".into() }
    pub fn local_model() -> String { "mistral".into() }
    pub fn local_max_tokens() -> u32 { 4096 }
    pub fn local_timeout() -> f64 { 30.0 }
    pub fn openai_model() -> String { "gpt-4o".into() }
    pub fn openai_timeout() -> f64 { 60.0 }
    pub fn hosted_max_tokens() -> u32 { 4096 }
    pub fn anthropic_model() -> String { "claude-3-sonnet-20240229".into() }
    pub fn anthropic_timeout() -> f64 { 120.0 }

    pub fn fallback_order() -> HashMap<String, Vec<String>> {
        HashMap::from([
            ("local".into(), vec!["openai".into(), "anthropic".into()]),
            ("openai".into(), vec!["anthropic".into(), "local".into()]),
            ("anthropic".into(), vec!["openai".into(), "local".into()]),
        ])
    }
}
