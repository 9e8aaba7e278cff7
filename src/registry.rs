//! Backend registry — immutable descriptors for every configured upstream.
//!
//! The registry is built once at startup from [`Settings`] and shared as
//! `Arc<ModelRegistry>`. Insertion order is significant: classifier ties are
//! broken by the first-registered backend, and enumeration endpoints list
//! backends in this order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::types::Priority;

/// Closed set of capability tags a backend can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BasicChat,
    CodeGeneration,
    Math,
    Reasoning,
    Summarization,
    CreativeWriting,
    DataAnalysis,
    SystemDesign,
    LongContext,
    FunctionCalling,
    TextExtraction,
    Classification,
    LegalAnalysis,
    ScientificKnowledge,
    JsonMode,
    Multilingual,
    StructuredOutput,
    ToolUse,
    ImageUnderstanding,
    CodeExecution,
    RetrievalAugmentedGeneration,
    ConversationalMemory,
    FastResponse,
    StepByStepReasoning,
    FileCreation,
}

impl Capability {
    /// The wire/tag name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BasicChat => "basic_chat",
            Self::CodeGeneration => "code_generation",
            Self::Math => "math",
            Self::Reasoning => "reasoning",
            Self::Summarization => "summarization",
            Self::CreativeWriting => "creative_writing",
            Self::DataAnalysis => "data_analysis",
            Self::SystemDesign => "system_design",
            Self::LongContext => "long_context",
            Self::FunctionCalling => "function_calling",
            Self::TextExtraction => "text_extraction",
            Self::Classification => "classification",
            Self::LegalAnalysis => "legal_analysis",
            Self::ScientificKnowledge => "scientific_knowledge",
            Self::JsonMode => "json_mode",
            Self::Multilingual => "multilingual",
            Self::StructuredOutput => "structured_output",
            Self::ToolUse => "tool_use",
            Self::ImageUnderstanding => "image_understanding",
            Self::CodeExecution => "code_execution",
            Self::RetrievalAugmentedGeneration => "retrieval_augmented_generation",
            Self::ConversationalMemory => "conversational_memory",
            Self::FastResponse => "fast_response",
            Self::StepByStepReasoning => "step_by_step_reasoning",
            Self::FileCreation => "file_creation",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority ranks per selection dimension. 1 is best, 3 is worst.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PriorityRanks {
    pub speed: u8,
    pub cost: u8,
    pub quality: u8,
}

impl PriorityRanks {
    pub fn rank(&self, dimension: Priority) -> u8 {
        match dimension {
            Priority::Speed => self.speed,
            Priority::Cost => self.cost,
            Priority::Quality => self.quality,
        }
    }
}

impl Default for PriorityRanks {
    fn default() -> Self {
        Self { speed: 2, cost: 2, quality: 2 }
    }
}

/// Immutable description of one upstream backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendDescriptor {
    /// Stable key (`local`, `openai`, `anthropic`).
    pub key: String,
    /// Display name.
    pub name: String,
    /// Provider tag (`lmstudio`, `openai`, `anthropic`).
    pub provider: String,
    /// Upstream model id, e.g. `gpt-4o`.
    pub model_id: String,
    pub capabilities: Vec<Capability>,
    pub cost_per_1k_tokens: f64,
    /// Estimated average latency in milliseconds.
    pub avg_latency_ms: u64,
    /// Maximum output tokens the backend accepts.
    pub max_tokens: u32,
    /// Prompts longer than this (chars) are truncated by the adapter.
    pub max_prompt_length: usize,
    pub supports_streaming: bool,
    pub priority: PriorityRanks,
    /// Backends to try, in order, when this one fails.
    pub fallback: Vec<String>,
    /// Seconds between background health probes.
    pub health_check_interval: u64,
    pub description: String,
}

impl BackendDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.supports(*c))
    }

    pub fn supports_any(&self, required: &[Capability]) -> bool {
        required.iter().any(|c| self.supports(*c))
    }
}

/// Registry of all configured backends, plus a capability reverse index.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    order: Vec<String>,
    by_key: HashMap<String, Arc<BackendDescriptor>>,
    capability_index: HashMap<Capability, Vec<String>>,
}

impl ModelRegistry {
    pub fn new(descriptors: Vec<BackendDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    fn insert(&mut self, descriptor: BackendDescriptor) {
        let key = descriptor.key.clone();
        for capability in &descriptor.capabilities {
            self.capability_index
                .entry(*capability)
                .or_default()
                .push(key.clone());
        }
        self.order.push(key.clone());
        self.by_key.insert(key, Arc::new(descriptor));
    }

    pub fn get(&self, key: &str) -> Option<&Arc<BackendDescriptor>> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Backend keys in registry insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Descriptors in registry insertion order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<BackendDescriptor>> {
        self.order.iter().filter_map(|k| self.by_key.get(k))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Backends declaring the given capability, in insertion order.
    pub fn backends_with(&self, capability: Capability) -> &[String] {
        self.capability_index
            .get(&capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The full capability → backends mapping.
    pub fn capability_index(&self) -> &HashMap<Capability, Vec<String>> {
        &self.capability_index
    }
}

/// Build the registry from application settings.
///
/// Descriptor constants (capability sets, priority ranks, latency and cost
/// estimates, prompt-length caps) characterize each provider class and are
/// not user-configurable; model ids, token limits and fallback orders come
/// from settings.
pub fn build_registry(settings: &Settings) -> ModelRegistry {
    use Capability::*;

    ModelRegistry::new(vec![
        BackendDescriptor {
            key: "local".into(),
            name: "local-lmstudio".into(),
            provider: "lmstudio".into(),
            model_id: settings.local.model.clone(),
            capabilities: vec![BasicChat, Math, FastResponse, FileCreation],
            cost_per_1k_tokens: 0.0,
            avg_latency_ms: 500,
            max_tokens: settings.local.max_tokens,
            max_prompt_length: 4_000,
            supports_streaming: true,
            priority: PriorityRanks { speed: 1, cost: 1, quality: 3 },
            fallback: settings.fallback_order("local"),
            health_check_interval: 600,
            description: "Local model endpoint - fastest and cheapest, good for simple tasks"
                .into(),
        },
        BackendDescriptor {
            key: "openai".into(),
            name: "gpt-4o".into(),
            provider: "openai".into(),
            model_id: settings.openai.model.clone(),
            capabilities: vec![
                BasicChat,
                CodeGeneration,
                Reasoning,
                Summarization,
                DataAnalysis,
                FunctionCalling,
                JsonMode,
                StructuredOutput,
                ToolUse,
                Multilingual,
                StepByStepReasoning,
            ],
            cost_per_1k_tokens: 0.01,
            avg_latency_ms: 2_000,
            max_tokens: 128_000,
            max_prompt_length: 100_000,
            supports_streaming: true,
            priority: PriorityRanks { speed: 2, cost: 2, quality: 1 },
            fallback: settings.fallback_order("openai"),
            health_check_interval: 300,
            description: "Hosted OpenAI-compatible model - balanced performance, good for coding and technical tasks"
                .into(),
        },
        BackendDescriptor {
            key: "anthropic".into(),
            name: "claude-3-sonnet".into(),
            provider: "anthropic".into(),
            model_id: settings.anthropic.model.clone(),
            capabilities: vec![
                BasicChat,
                LongContext,
                LegalAnalysis,
                Reasoning,
                CreativeWriting,
                ScientificKnowledge,
                Multilingual,
                ImageUnderstanding,
                StructuredOutput,
                StepByStepReasoning,
            ],
            cost_per_1k_tokens: 0.015,
            avg_latency_ms: 3_000,
            max_tokens: 200_000,
            max_prompt_length: 150_000,
            supports_streaming: true,
            priority: PriorityRanks { speed: 3, cost: 3, quality: 1 },
            fallback: settings.fallback_order("anthropic"),
            health_check_interval: 300,
            description: "Hosted Anthropic-compatible model - highest quality for complex reasoning, legal, scientific and creative tasks"
                .into(),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_registry() -> ModelRegistry {
        build_registry(&Settings::default())
    }

    // -----------------------------------------------------------------------
    // Capability serialization
    // -----------------------------------------------------------------------

    #[test]
    fn capability_serializes_to_snake_case_tags() {
        assert_eq!(
            serde_json::to_string(&Capability::CodeGeneration).unwrap(),
            "\"code_generation\""
        );
        assert_eq!(
            serde_json::to_string(&Capability::RetrievalAugmentedGeneration).unwrap(),
            "\"retrieval_augmented_generation\""
        );
    }

    #[test]
    fn capability_as_str_matches_serde_representation() {
        for cap in [
            Capability::BasicChat,
            Capability::LegalAnalysis,
            Capability::StepByStepReasoning,
            Capability::RetrievalAugmentedGeneration,
            Capability::FileCreation,
        ] {
            let serialized = serde_json::to_string(&cap).unwrap();
            assert_eq!(serialized, format!("\"{}\"", cap.as_str()));
        }
    }

    #[test]
    fn capability_round_trips_through_json() {
        let cap: Capability = serde_json::from_str("\"legal_analysis\"").unwrap();
        assert_eq!(cap, Capability::LegalAnalysis);
    }

    // -----------------------------------------------------------------------
    // Registry construction
    // -----------------------------------------------------------------------

    #[test]
    fn default_registry_contains_three_backends_in_order() {
        let registry = default_registry();
        let keys: Vec<&str> = registry.keys().collect();
        assert_eq!(keys, vec!["local", "openai", "anthropic"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn capability_index_maps_tags_to_backends() {
        let registry = default_registry();
        assert_eq!(registry.backends_with(Capability::CodeGeneration), ["openai"]);
        assert_eq!(registry.backends_with(Capability::LegalAnalysis), ["anthropic"]);
        assert_eq!(
            registry.backends_with(Capability::BasicChat),
            ["local", "openai", "anthropic"]
        );
        assert!(registry.backends_with(Capability::CodeExecution).is_empty());
    }

    #[test]
    fn descriptors_expose_capability_queries() {
        let registry = default_registry();
        let openai = registry.get("openai").unwrap();
        assert!(openai.supports(Capability::CodeGeneration));
        assert!(!openai.supports(Capability::LegalAnalysis));
        assert!(openai.supports_all(&[Capability::Reasoning, Capability::ToolUse]));
        assert!(!openai.supports_all(&[Capability::Reasoning, Capability::LongContext]));
        assert!(openai.supports_any(&[Capability::LongContext, Capability::JsonMode]));
    }

    #[test]
    fn fallback_orders_come_from_settings() {
        let registry = default_registry();
        assert_eq!(registry.get("local").unwrap().fallback, vec!["openai", "anthropic"]);
        assert_eq!(registry.get("anthropic").unwrap().fallback, vec!["openai", "local"]);
    }

    #[test]
    fn model_ids_come_from_settings() {
        let mut settings = Settings::default();
        settings.openai.model = "gpt-4-turbo".into();
        let registry = build_registry(&settings);
        assert_eq!(registry.get("openai").unwrap().model_id, "gpt-4-turbo");
    }

    #[test]
    fn priority_ranks_follow_provider_class() {
        let registry = default_registry();
        let local = registry.get("local").unwrap();
        assert_eq!(local.priority.rank(Priority::Speed), 1);
        assert_eq!(local.priority.rank(Priority::Quality), 3);
        let anthropic = registry.get("anthropic").unwrap();
        assert_eq!(anthropic.priority.rank(Priority::Quality), 1);
        assert_eq!(anthropic.priority.rank(Priority::Speed), 3);
    }

    #[test]
    fn unknown_key_lookups_return_none() {
        let registry = default_registry();
        assert!(registry.get("mystery").is_none());
        assert!(!registry.contains("mystery"));
    }
}
