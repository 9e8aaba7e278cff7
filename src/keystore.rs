//! Provider credential store.
//!
//! A small key/settings table keyed by provider, loaded once at startup and
//! consulted at adapter init: an *active* record overrides the
//! configuration-provided credentials (and optionally the model id, base URL
//! and organization) for its provider. Backed by a JSON file so operators
//! can rotate keys without touching the main config.
//!
//! ```json
//! [
//!   { "provider": "openai", "api_key": "sk-...", "is_active": true },
//!   { "provider": "anthropic", "api_key": "old-key", "is_active": false }
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{AnthropicSettings, OpenAiSettings};

/// One provider's stored credentials and optional setting overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderRecord {
    pub provider: String,
    pub api_key: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ProviderRecord {
    /// Overlay this record onto OpenAI settings.
    pub fn apply_openai(&self, settings: &mut OpenAiSettings) {
        settings.api_key = Some(self.api_key.clone());
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(base) = &self.api_base {
            settings.base_url = Some(base.clone());
        }
        if let Some(org) = &self.organization {
            settings.organization = Some(org.clone());
        }
    }

    /// Overlay this record onto Anthropic settings.
    pub fn apply_anthropic(&self, settings: &mut AnthropicSettings) {
        settings.api_key = Some(self.api_key.clone());
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(base) = &self.api_base {
            settings.base_url = Some(base.clone());
        }
    }
}

/// Provider → record table. Inactive records are retained but never served.
#[derive(Debug, Default)]
pub struct ProviderKeyStore {
    records: HashMap<String, ProviderRecord>,
}

impl ProviderKeyStore {
    /// A store with no records (store disabled or file absent).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load records from the JSON file. A missing file yields an empty
    /// store; a malformed file is a startup error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no key store file, starting empty");
            return Ok(Self::empty());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading key store {}", path.display()))?;
        let records: Vec<ProviderRecord> =
            serde_json::from_str(&content).context("parsing key store JSON")?;

        // Last record per provider wins, matching table upsert semantics.
        let records: HashMap<String, ProviderRecord> = records
            .into_iter()
            .map(|r| (r.provider.clone(), r))
            .collect();

        info!(count = records.len(), "loaded provider key store");
        Ok(Self { records })
    }

    /// The active record for a provider, if one exists with a usable key.
    pub fn active(&self, provider: &str) -> Option<&ProviderRecord> {
        self.records
            .get(provider)
            .filter(|r| r.is_active && !r.api_key.is_empty())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
