//! Response cache over Redis.
//!
//! Entries are keyed by an exact-match fingerprint of the prompt plus the
//! cache-relevant metadata fields. Alongside every entry, the fingerprint is
//! added to a per-backend index set (`<prefix>models:<backend>`) so one
//! backend's entries can be invalidated without scanning the whole keyspace.
//!
//! The cache is strictly best-effort: every error is logged and swallowed,
//! and a lost connection degrades to cache-miss behavior. Reconnection is
//! attempted no more often than `reconnect_delay` seconds; consecutive
//! failures beyond `max_retries` leave the cache disabled until the next
//! scheduled attempt.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::CacheSettings;
use crate::types::{unix_timestamp, RequestMetadata, ResponseEnvelope};

/// SCAN/DEL batch ceiling.
const SCAN_BATCH: usize = 1000;

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: u64,
    /// Entry counts per backend, from the index sets.
    pub models: HashMap<String, u64>,
    pub memory_usage_bytes: u64,
    pub ttl_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ConnState {
    manager: Option<ConnectionManager>,
    connection_errors: u32,
    last_connection_attempt: f64,
}

/// Async response cache. Cheap to share behind an `Arc`.
pub struct ResponseCache {
    settings: CacheSettings,
    state: Mutex<ConnState>,
}

impl ResponseCache {
    /// Connect to the configured store. A failed initial connection is not
    /// fatal — the cache starts disconnected and recovers in the background
    /// of subsequent operations.
    pub async fn connect(settings: CacheSettings) -> Self {
        let cache = Self {
            settings,
            state: Mutex::new(ConnState {
                manager: None,
                connection_errors: 0,
                last_connection_attempt: 0.0,
            }),
        };

        if cache.settings.enabled {
            let mut state = cache.state.lock().await;
            match cache.open_manager().await {
                Ok(manager) => {
                    info!("response cache connected");
                    state.manager = Some(manager);
                }
                Err(e) => {
                    warn!(error = %e, "response cache unavailable at startup, will retry");
                    state.connection_errors = 1;
                }
            }
            state.last_connection_attempt = unix_timestamp();
        }

        cache
    }

    /// A cache that never stores anything (config-disabled or tests).
    pub fn disabled() -> Self {
        Self {
            settings: CacheSettings { enabled: false, ..CacheSettings::default() },
            state: Mutex::new(ConnState {
                manager: None,
                connection_errors: 0,
                last_connection_attempt: 0.0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    async fn open_manager(&self) -> anyhow::Result<ConnectionManager> {
        let client = redis::Client::open(self.settings.url())?;
        let connect = client.get_connection_manager();
        let manager = tokio::time::timeout(
            std::time::Duration::from_secs_f64(self.settings.connect_timeout),
            connect,
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect timeout"))??;
        Ok(manager)
    }

    /// Verify (or restore) the connection, returning a handle when usable.
    ///
    /// Reconnect attempts are spaced at least `reconnect_delay` apart; in
    /// between, operations see a disabled cache and return immediately.
    async fn ensure_connection(&self) -> Option<ConnectionManager> {
        if !self.settings.enabled {
            return None;
        }

        let mut state = self.state.lock().await;

        if let Some(manager) = &state.manager {
            let mut conn = manager.clone();
            match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => return Some(manager.clone()),
                Err(e) => {
                    warn!(error = %e, "cache connection lost");
                    state.manager = None;
                }
            }
        }

        let now = unix_timestamp();
        if now - state.last_connection_attempt < self.settings.reconnect_delay as f64 {
            return None;
        }

        state.last_connection_attempt = now;
        if state.connection_errors >= self.settings.max_retries {
            debug!(
                errors = state.connection_errors,
                "cache reconnect window reached after repeated failures"
            );
        }

        info!("attempting cache reconnect");
        match self.open_manager().await {
            Ok(manager) => {
                info!("cache reconnected");
                state.connection_errors = 0;
                state.manager = Some(manager.clone());
                Some(manager)
            }
            Err(e) => {
                state.connection_errors += 1;
                warn!(error = %e, errors = state.connection_errors, "cache reconnect failed");
                None
            }
        }
    }

    /// Look up a cached envelope for the prompt/metadata pair.
    pub async fn get(
        &self,
        prompt: &str,
        metadata: &RequestMetadata,
    ) -> Option<ResponseEnvelope> {
        let mut conn = self.ensure_connection().await?;
        let key = fingerprint(&self.settings.key_prefix, prompt, metadata);

        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ResponseEnvelope>(&raw) {
                Ok(mut envelope) => {
                    debug!(key = %&key[..key.len().min(24)], "cache hit");
                    envelope.from_cache = true;
                    envelope.cache_key = Some(key);
                    Some(envelope)
                }
                Err(e) => {
                    error!(error = %e, "cache entry failed to deserialize, ignoring");
                    None
                }
            },
            Ok(None) => {
                debug!(key = %&key[..key.len().min(24)], "cache miss");
                None
            }
            Err(e) => {
                error!(error = %e, "cache get failed");
                None
            }
        }
    }

    /// Store an envelope. Returns true when the entry was written.
    ///
    /// Error and fallback envelopes are never stored. Cache-provenance fields
    /// are stripped so a later hit re-attaches fresh ones.
    pub async fn set(
        &self,
        prompt: &str,
        envelope: &ResponseEnvelope,
        metadata: &RequestMetadata,
    ) -> bool {
        let Some(entry) = prepare_for_cache(envelope) else {
            debug!("skipping cache for error/fallback response");
            return false;
        };

        let Some(mut conn) = self.ensure_connection().await else { return false };
        let key = fingerprint(&self.settings.key_prefix, prompt, metadata);
        let ttl = metadata.cache_ttl.unwrap_or(self.settings.ttl);

        let serialized = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "envelope failed to serialize for cache");
                return false;
            }
        };

        if let Err(e) = conn.set_ex::<_, _, ()>(&key, serialized, ttl).await {
            error!(error = %e, "cache set failed");
            return false;
        }

        // Index the fingerprint under its backend for selective invalidation.
        let index_key = format!("{}models:{}", self.settings.key_prefix, entry.model_used);
        if let Err(e) = conn.sadd::<_, _, ()>(&index_key, &key).await {
            error!(error = %e, "cache index update failed");
        }

        debug!(key = %&key[..key.len().min(24)], ttl, "cached response");
        true
    }

    /// Delete cached entries. With a backend, only that backend's entries are
    /// removed (via the index set); without, the full keyspace under the
    /// prefix is scanned and cleared. Returns the number of deleted entries.
    pub async fn clear(&self, backend: Option<&str>) -> u64 {
        let Some(mut conn) = self.ensure_connection().await else { return 0 };

        let result = match backend {
            Some(backend) => self.clear_backend(&mut conn, backend).await,
            None => self.clear_all(&mut conn).await,
        };

        match result {
            Ok(count) => {
                info!(count, backend = backend.unwrap_or("*"), "cleared cache entries");
                count
            }
            Err(e) => {
                error!(error = %e, "cache clear failed");
                0
            }
        }
    }

    async fn clear_backend(
        &self,
        conn: &mut ConnectionManager,
        backend: &str,
    ) -> anyhow::Result<u64> {
        let index_key = format!("{}models:{}", self.settings.key_prefix, backend);
        let members: Vec<String> = conn.smembers(&index_key).await?;

        let mut cleared = 0u64;
        if !members.is_empty() {
            cleared = conn.del(members).await?;
        }
        let _: u64 = conn.del(&index_key).await?;
        Ok(cleared)
    }

    async fn clear_all(&self, conn: &mut ConnectionManager) -> anyhow::Result<u64> {
        let keys = self
            .scan_keys(conn, &format!("{}*", self.settings.key_prefix))
            .await?;

        let mut cleared = 0u64;
        for batch in keys.chunks(SCAN_BATCH) {
            cleared += conn.del::<_, u64>(batch.to_vec()).await?;
        }
        Ok(cleared)
    }

    async fn scan_keys(
        &self,
        conn: &mut ConnectionManager,
        pattern: &str,
    ) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Entry counts and memory usage.
    pub async fn stats(&self) -> CacheStats {
        let Some(mut conn) = self.ensure_connection().await else {
            return CacheStats {
                enabled: false,
                ttl_seconds: self.settings.ttl,
                ..CacheStats::default()
            };
        };

        match self.collect_stats(&mut conn).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "cache stats failed");
                CacheStats {
                    enabled: false,
                    error: Some(e.to_string()),
                    ttl_seconds: self.settings.ttl,
                    ..CacheStats::default()
                }
            }
        }
    }

    async fn collect_stats(&self, conn: &mut ConnectionManager) -> anyhow::Result<CacheStats> {
        let prefix = &self.settings.key_prefix;
        let index_prefix = format!("{prefix}models:");

        let memory_usage_bytes = redis::cmd("INFO")
            .arg("memory")
            .query_async::<String>(conn)
            .await
            .ok()
            .and_then(|info| {
                info.lines()
                    .find_map(|line| line.strip_prefix("used_memory:"))
                    .and_then(|v| v.trim().parse::<u64>().ok())
            })
            .unwrap_or(0);

        let all_keys = self.scan_keys(conn, &format!("{prefix}*")).await?;
        let entries = all_keys
            .iter()
            .filter(|k| !k.starts_with(&index_prefix))
            .count() as u64;

        let mut models = HashMap::new();
        for index_key in all_keys.iter().filter(|k| k.starts_with(&index_prefix)) {
            let backend = index_key
                .rsplit(':')
                .next()
                .unwrap_or_default()
                .to_string();
            let count: u64 = conn.scard(index_key).await?;
            models.insert(backend, count);
        }

        Ok(CacheStats {
            enabled: true,
            entries,
            models,
            memory_usage_bytes,
            ttl_seconds: self.settings.ttl,
            error: None,
        })
    }

    /// Drop the connection. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.manager.take().is_some() {
            info!("response cache connection closed");
        }
    }
}

/// Compute the cache fingerprint for a prompt/metadata pair.
///
/// Only the cache-relevant metadata fields participate; everything else —
/// `request_id` included — is excluded, so retries and unrelated metadata
/// hit the same entry. When a model is forced, the backend name is prefixed
/// into the key so model-scoped invalidation can enumerate by prefix.
pub fn fingerprint(prefix: &str, prompt: &str, metadata: &RequestMetadata) -> String {
    // BTreeMap keeps the canonical form key-ordered regardless of build
    // features; the outer struct serializes in declaration order.
    #[derive(Serialize)]
    struct KeyData<'a> {
        metadata: BTreeMap<&'static str, Value>,
        prompt: &'a str,
    }

    let mut filtered: BTreeMap<&'static str, Value> = BTreeMap::new();
    if let Some(model) = &metadata.model {
        filtered.insert("model", json!(model));
        filtered.insert("forced_model", json!(model));
    }
    if let Some(temperature) = metadata.temperature {
        filtered.insert("temperature", json!(temperature));
    }
    if let Some(max_tokens) = metadata.max_tokens {
        filtered.insert("max_tokens", json!(max_tokens));
    }
    if let Some(user_id) = &metadata.user_id {
        filtered.insert("user_id", json!(user_id));
    }
    if let Some(priority) = metadata.priority {
        filtered.insert("priority", json!(priority.as_str()));
    }
    if let Some(language) = metadata.extra.get("language") {
        filtered.insert("language", language.clone());
    }
    if metadata.stream {
        filtered.insert("stream", json!(true));
    }

    let serialized = serde_json::to_string(&KeyData { metadata: filtered, prompt })
        .expect("fingerprint key data always serializes");

    let digest = Sha256::digest(serialized.as_bytes());
    let mut hash = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hash, "{byte:02x}");
    }

    match &metadata.model {
        Some(model) => format!("{prefix}{model}:{hash}"),
        None => format!("{prefix}{hash}"),
    }
}

/// Strip cache-provenance fields and refuse uncacheable envelopes.
///
/// Returns `None` for error or fallback envelopes — those must never be
/// served from cache.
pub fn prepare_for_cache(envelope: &ResponseEnvelope) -> Option<ResponseEnvelope> {
    if envelope.error || envelope.fallback {
        return None;
    }
    let mut entry = envelope.clone();
    entry.from_cache = false;
    entry.cache_key = None;
    entry.cache_latency_ms = None;
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn metadata(value: serde_json::Value) -> RequestMetadata {
        serde_json::from_value(value).unwrap()
    }

    // -----------------------------------------------------------------------
    // Fingerprinting
    // -----------------------------------------------------------------------

    #[test]
    fn fingerprint_is_deterministic() {
        let m = metadata(json!({ "temperature": 0.3 }));
        let a = fingerprint("pg:", "Summarize X", &m);
        let b = fingerprint("pg:", "Summarize X", &m);
        assert_eq!(a, b);
        assert!(a.starts_with("pg:"));
        // prefix + 64 hex chars
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn fingerprint_ignores_request_id_and_unknown_fields() {
        let plain = metadata(json!({ "temperature": 0.3 }));
        let noisy = metadata(json!({
            "temperature": 0.3,
            "request_id": "R",
            "trace": "abc123",
            "use_cache": true,
        }));
        assert_eq!(
            fingerprint("pg:", "Summarize X", &plain),
            fingerprint("pg:", "Summarize X", &noisy)
        );
    }

    #[test]
    fn fingerprint_changes_with_relevant_fields() {
        let base = metadata(json!({ "temperature": 0.3 }));
        let warmer = metadata(json!({ "temperature": 0.9 }));
        let other_user = metadata(json!({ "temperature": 0.3, "user_id": "u1" }));
        let prioritized = metadata(json!({ "temperature": 0.3, "priority": "speed" }));

        let key = fingerprint("pg:", "p", &base);
        assert_ne!(key, fingerprint("pg:", "p", &warmer));
        assert_ne!(key, fingerprint("pg:", "p", &other_user));
        assert_ne!(key, fingerprint("pg:", "p", &prioritized));
        assert_ne!(key, fingerprint("pg:", "different prompt", &base));
    }

    #[test]
    fn fingerprint_prefixes_forced_model_for_enumeration() {
        let forced = metadata(json!({ "model": "openai" }));
        let key = fingerprint("pg:", "p", &forced);
        assert!(key.starts_with("pg:openai:"), "key was {key}");

        // Forcing a model must also change the hash itself.
        let free = metadata(json!({}));
        let free_key = fingerprint("pg:", "p", &free);
        assert_ne!(key.rsplit(':').next(), free_key.rsplit(':').next());
    }

    #[test]
    fn fingerprint_reads_language_from_extra_fields() {
        let english = metadata(json!({ "language": "en" }));
        let german = metadata(json!({ "language": "de" }));
        assert_ne!(fingerprint("pg:", "p", &english), fingerprint("pg:", "p", &german));
    }

    #[test]
    fn fingerprint_uses_typed_priority_representation() {
        let via_json = metadata(json!({ "priority": "cost" }));
        let typed = RequestMetadata { priority: Some(Priority::Cost), ..Default::default() };
        assert_eq!(fingerprint("pg:", "p", &via_json), fingerprint("pg:", "p", &typed));
    }

    // -----------------------------------------------------------------------
    // Write policy
    // -----------------------------------------------------------------------

    #[test]
    fn prepare_strips_cache_provenance_fields() {
        let mut envelope = ResponseEnvelope::success("openai", "gpt-4o", "hi".into(), 100);
        envelope.from_cache = true;
        envelope.cache_key = Some("pg:abc".into());
        envelope.cache_latency_ms = Some(3);

        let entry = prepare_for_cache(&envelope).unwrap();
        assert!(!entry.from_cache);
        assert!(entry.cache_key.is_none());
        assert!(entry.cache_latency_ms.is_none());
        assert_eq!(entry.response, "hi");
    }

    #[test]
    fn prepare_refuses_error_envelopes() {
        let envelope = ResponseEnvelope::failure("openai", "server_error", "boom", 10);
        assert!(prepare_for_cache(&envelope).is_none());
    }

    #[test]
    fn prepare_refuses_fallback_envelopes() {
        let mut envelope = ResponseEnvelope::success("openai", "gpt-4o", "ok".into(), 10);
        envelope.fallback = true;
        envelope.fallback_reason = Some("primary failed".into());
        assert!(prepare_for_cache(&envelope).is_none());
    }

    // -----------------------------------------------------------------------
    // Disabled-cache behavior
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn disabled_cache_misses_and_noops() {
        let cache = ResponseCache::disabled();
        let m = RequestMetadata::default();
        let envelope = ResponseEnvelope::success("local", "mistral", "hello".into(), 5);

        assert!(cache.get("p", &m).await.is_none());
        assert!(!cache.set("p", &envelope, &m).await);
        assert_eq!(cache.clear(None).await, 0);
        assert_eq!(cache.clear(Some("local")).await, 0);

        let stats = cache.stats().await;
        assert!(!stats.enabled);
        assert_eq!(stats.entries, 0);

        // Idempotent close.
        cache.close().await;
        cache.close().await;
    }

    #[tokio::test]
    async fn enabled_cache_without_server_degrades_to_miss() {
        // Points at a port that nothing listens on; every op must degrade
        // gracefully within the reconnect window.
        let settings = CacheSettings {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout: 0.2,
            timeout: 0.2,
            reconnect_delay: 60,
            ..CacheSettings::default()
        };
        let cache = ResponseCache::connect(settings).await;
        let m = RequestMetadata::default();
        let envelope = ResponseEnvelope::success("local", "mistral", "hello".into(), 5);

        assert!(cache.get("p", &m).await.is_none());
        assert!(!cache.set("p", &envelope, &m).await);
        assert_eq!(cache.clear(None).await, 0);
    }
}
