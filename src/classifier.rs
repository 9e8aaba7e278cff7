//! Prompt classifier — deterministic backend scoring.
//!
//! The classifier is a pure function from `(prompt, metadata, registry)` to a
//! backend key plus a [`ClassificationResult`] diagnostic. Scoring combines:
//!
//! 1. keyword matches per backend (whole-word, case-insensitive)
//! 2. a fixed vector of normalized prompt features
//! 3. capability-weighted boosts for each backend's declared capabilities
//! 4. backend-specific heuristic adjustments
//! 5. metadata adjustments (priority, token budget, required capabilities)
//!
//! The only side effect is a bounded LRU memo with a 300-second TTL; behavior
//! is identical with the memo disabled. All regexes are compiled once at
//! construction — they are static patterns, so a compile failure is a
//! programming error and fails startup.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::registry::{Capability, ModelRegistry};
use crate::types::{ClassificationResult, ClassificationSource, RequestMetadata};

/// Minimum score any backend can end up with after heuristics.
const SCORE_FLOOR: f64 = 0.1;

/// Weight applied to raw keyword match counts.
const KEYWORD_WEIGHT: f64 = 0.5;

/// Weight applied to capability feature scores for declared capabilities.
const CAPABILITY_WEIGHT: f64 = 2.0;

/// Memo TTL; entries older than this are recomputed.
const MEMO_TTL: Duration = Duration::from_secs(300);

/// Memo capacity bound.
const MEMO_CAPACITY: usize = 1024;

/// Default per-backend intent keyword lists.
fn default_keywords() -> HashMap<String, Vec<String>> {
    let to_owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
    HashMap::from([
        (
            "local".to_string(),
            to_owned(&[
                "hello", "hi", "greetings", "create file", "basic math", "simple", "quick",
                "calculate", "help", "math", "what is", "example",
            ]),
        ),
        (
            "openai".to_string(),
            to_owned(&[
                "analyze", "summarize", "code", "compare", "write code", "debug", "complex",
                "explain", "how to", "review", "generate", "create function", "algorithm",
            ]),
        ),
        (
            "anthropic".to_string(),
            to_owned(&[
                "long document", "legal", "detailed reasoning", "extensive", "thorough",
                "comprehensive", "ethical", "draft", "essay", "research", "in-depth",
            ]),
        ),
    ])
}

/// Normalized feature vector extracted from one prompt. All scalar values
/// are in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct PromptFeatures {
    pub length: f64,
    pub word_count: f64,
    pub sentence_count: f64,
    pub question_count: f64,
    pub code_presence: f64,
    pub code_snippet_count: f64,
    pub math_presence: f64,
    pub is_instruction: f64,
    pub is_analysis: f64,
    pub is_question: f64,
    pub complexity_terms: f64,
    pub avg_word_length: f64,
    pub vocabulary_diversity: f64,
    /// Match scores from capability-specific patterns.
    pub capability_match: HashMap<Capability, f64>,
}

impl PromptFeatures {
    fn capability(&self, capability: Capability) -> f64 {
        self.capability_match.get(&capability).copied().unwrap_or(0.0)
    }

    fn scalars_json(&self) -> serde_json::Value {
        json!({
            "length": self.length,
            "word_count": self.word_count,
            "sentence_count": self.sentence_count,
            "question_count": self.question_count,
            "code_presence": self.code_presence,
            "code_snippet_count": self.code_snippet_count,
            "math_presence": self.math_presence,
            "is_instruction": self.is_instruction,
            "is_analysis": self.is_analysis,
            "is_question": self.is_question,
            "complexity_terms": self.complexity_terms,
            "avg_word_length": self.avg_word_length,
            "vocabulary_diversity": self.vocabulary_diversity,
        })
    }
}

struct MemoEntry {
    at: Instant,
    selected: String,
    result: ClassificationResult,
}

/// Deterministic prompt → backend classifier.
pub struct PromptClassifier {
    registry: Arc<ModelRegistry>,
    default_backend: String,
    keyword_patterns: Vec<(String, Vec<Regex>)>,
    code_pattern: Regex,
    fenced_pattern: Regex,
    instruction_pattern: Regex,
    analysis_pattern: Regex,
    question_pattern: Regex,
    word_pattern: Regex,
    complexity_patterns: Vec<Regex>,
    capability_patterns: Vec<(Capability, Regex)>,
    memo: Mutex<LruCache<u64, MemoEntry>>,
}

impl PromptClassifier {
    /// Build a classifier over the given registry with the default keyword
    /// lists.
    pub fn new(registry: Arc<ModelRegistry>, default_backend: &str) -> Self {
        Self::with_keywords(registry, default_backend, default_keywords())
    }

    /// Build a classifier with caller-supplied keyword lists (keyed by
    /// backend).
    pub fn with_keywords(
        registry: Arc<ModelRegistry>,
        default_backend: &str,
        keywords: HashMap<String, Vec<String>>,
    ) -> Self {
        // Keyword patterns follow registry insertion order so scoring maps
        // iterate deterministically.
        let keyword_patterns = registry
            .keys()
            .map(|key| {
                let patterns = keywords
                    .get(key)
                    .map(|words| {
                        words
                            .iter()
                            .map(|word| {
                                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word)))
                                    .expect("escaped keyword pattern always compiles")
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (key.to_string(), patterns)
            })
            .collect();

        let compile = |pattern: &str| {
            Regex::new(pattern).expect("static classifier pattern always compiles")
        };

        let complexity_patterns = [
            "explain", "analyze", "compare", "contrast", "evaluate", "synthesize", "examine",
            "investigate", "discuss", "elaborate",
        ]
        .iter()
        .map(|term| compile(&format!(r"(?i)\b{term}\b")))
        .collect();

        let capability_patterns = vec![
            (
                Capability::CodeGeneration,
                compile(r"(?i)\b(code|program|function|algorithm|class|method|library|api|module)\b"),
            ),
            (
                Capability::Reasoning,
                compile(r"(?i)\b(reason|logic|infer|deduce|conclude|why|because|therefore)\b"),
            ),
            (
                Capability::Summarization,
                compile(r"(?i)\b(summarize|summary|overview|brief|condense|digest|synopsis)\b"),
            ),
            (
                Capability::CreativeWriting,
                compile(r"(?i)\b(creative|story|fiction|narrative|poem|essay|write|describe)\b"),
            ),
            (
                Capability::DataAnalysis,
                compile(r"(?i)\b(data|analysis|statistics|trend|metric|chart|graph|analyze)\b"),
            ),
            (
                Capability::SystemDesign,
                compile(r"(?i)\b(design|system|architecture|component|structure|framework|diagram)\b"),
            ),
            (
                Capability::LongContext,
                compile(r"(?i)\b(document|long|lengthy|comprehensive|detailed|extensive|thorough)\b"),
            ),
            (
                Capability::FunctionCalling,
                compile(r"(?i)\b(api|function|call|invoke|execute|run|trigger|action)\b"),
            ),
            (
                Capability::LegalAnalysis,
                compile(r"(?i)\b(legal|law|contract|agreement|terms|clause|provision|rights|obligations)\b"),
            ),
            (
                Capability::ScientificKnowledge,
                compile(r"(?i)\b(science|scientific|research|experiment|theory|hypothesis|formula|equation)\b"),
            ),
        ];

        info!(backends = registry.len(), "prompt classifier initialized");

        Self {
            registry,
            default_backend: default_backend.to_string(),
            keyword_patterns,
            code_pattern: compile(r"```\w*\n[\s\S]*?\n```|`[^`]+`|\bfunction\b|\bclass\b|\bdef\b"),
            fenced_pattern: compile(r"```\w*\n[\s\S]*?\n```"),
            instruction_pattern: compile(r"(?i)\b(create|make|generate|build|implement|write|develop)\b"),
            analysis_pattern: compile(r"(?i)\b(analyze|examine|investigate|evaluate|assess|research)\b"),
            question_pattern: compile(r"(?i)\bwhy\b|\bhow\b|\bwhat\b|\bwhen\b|\bwhere\b|\bwhich\b|\bwho\b|\bwhose\b"),
            word_pattern: compile(r"\b\w+\b"),
            complexity_patterns,
            capability_patterns,
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMO_CAPACITY).expect("memo capacity is non-zero"),
            )),
        }
    }

    /// Classify a prompt, returning the selected backend key and diagnostics.
    pub fn classify(
        &self,
        prompt: &str,
        metadata: &RequestMetadata,
    ) -> (String, ClassificationResult) {
        let memo_key = self.memo_key(prompt, metadata);
        if let Some((selected, result)) = self.memo_get(memo_key) {
            debug!(backend = %selected, "classification served from memo");
            return (selected, result);
        }

        // Direct model override through metadata.
        if let Some(requested) = metadata.model.as_deref() {
            if self.registry.contains(requested) {
                info!(model = requested, "using caller-specified backend");
                let result = ClassificationResult::overridden(requested);
                self.memo_put(memo_key, requested.to_string(), result.clone());
                return (requested.to_string(), result);
            }
            warn!(model = requested, "caller requested unknown backend, falling through to classification");
        }

        let keyword_scores = self.count_keyword_matches(prompt);
        let features = self.extract_features(prompt);
        let model_scores = self.determine_scores(&keyword_scores, &features);
        let adjusted_scores = self.apply_metadata_adjustments(&model_scores, metadata);

        // All scores at the floor means nothing distinguished the backends.
        let all_floor = adjusted_scores
            .iter()
            .all(|(_, score)| (score - SCORE_FLOOR).abs() < f64::EPSILON);

        let (selected, confidence) = if all_floor {
            info!(default = %self.default_backend, "no clear backend match, using default");
            (self.default_backend.clone(), 0.5)
        } else {
            // Argmax with ties broken by registry insertion order.
            let (best_key, best_score) = adjusted_scores
                .iter()
                .fold(None::<(&str, f64)>, |best, (key, score)| match best {
                    Some((_, top)) if *score <= top => best,
                    _ => Some((key.as_str(), *score)),
                })
                .expect("registry is never empty");
            let total: f64 = adjusted_scores.iter().map(|(_, s)| s).sum();
            let confidence = if total > 0.0 { best_score / total } else { 0.5 };
            (best_key.to_string(), confidence)
        };

        let confidence = (confidence * 1000.0).round() / 1000.0;

        let result = ClassificationResult {
            selected_model: selected.clone(),
            confidence,
            source: ClassificationSource::RuleBased,
            reasoning: json!({
                "keyword_matches": keyword_scores.iter().cloned().collect::<HashMap<_, _>>(),
                "features": features.scalars_json(),
                "model_scores": model_scores.iter().cloned().collect::<HashMap<_, _>>(),
                "adjusted_scores": adjusted_scores.iter().cloned().collect::<HashMap<_, _>>(),
            }),
            health_fallback: None,
            original_model: None,
        };

        info!(backend = %selected, confidence, "classified prompt");
        self.memo_put(memo_key, selected.clone(), result.clone());

        (selected, result)
    }

    // -- scoring pipeline ---------------------------------------------------

    /// Whole-word keyword occurrences per backend, in registry order.
    fn count_keyword_matches(&self, prompt: &str) -> Vec<(String, u32)> {
        self.keyword_patterns
            .iter()
            .map(|(key, patterns)| {
                let count = patterns
                    .iter()
                    .map(|p| p.find_iter(prompt).count() as u32)
                    .sum();
                (key.clone(), count)
            })
            .collect()
    }

    /// Extract the normalized feature vector for a prompt.
    pub fn extract_features(&self, prompt: &str) -> PromptFeatures {
        let words: Vec<&str> = self
            .word_pattern
            .find_iter(prompt)
            .map(|m| m.as_str())
            .collect();

        let avg_word_length = if words.is_empty() {
            0.0
        } else {
            let total: usize = words.iter().map(|w| w.chars().count()).sum();
            (total as f64 / words.len() as f64 / 8.0).min(1.0)
        };

        let vocabulary_diversity = if words.is_empty() {
            0.0
        } else {
            let unique: std::collections::HashSet<String> =
                words.iter().map(|w| w.to_lowercase()).collect();
            (unique.len() as f64 / (words.len() as f64).powf(0.7)).min(1.0)
        };

        let complexity_hits = self
            .complexity_patterns
            .iter()
            .filter(|p| p.is_match(prompt))
            .count();

        let capability_match = self
            .capability_patterns
            .iter()
            .map(|(capability, pattern)| {
                let matches = pattern.find_iter(prompt).count();
                (*capability, (matches as f64 / 5.0).min(1.0))
            })
            .collect();

        PromptFeatures {
            length: (prompt.chars().count() as f64 / 2000.0).min(1.0),
            word_count: (prompt.split_whitespace().count() as f64 / 300.0).min(1.0),
            sentence_count: (prompt.matches('.').count() as f64 / 20.0).min(1.0),
            question_count: (prompt.matches('?').count() as f64 / 5.0).min(1.0),
            code_presence: if self.code_pattern.is_match(prompt) { 1.0 } else { 0.0 },
            code_snippet_count: (self.fenced_pattern.find_iter(prompt).count() as f64 / 3.0)
                .min(1.0),
            math_presence: if prompt.contains(['+', '-', '*', '/', '=', '<', '>']) {
                1.0
            } else {
                0.0
            },
            is_instruction: if self.instruction_pattern.is_match(prompt) { 1.0 } else { 0.0 },
            is_analysis: if self.analysis_pattern.is_match(prompt) { 1.0 } else { 0.0 },
            is_question: if self.question_pattern.is_match(prompt) { 1.0 } else { 0.0 },
            complexity_terms: (complexity_hits as f64 / 5.0).min(1.0),
            avg_word_length,
            vocabulary_diversity,
            capability_match,
        }
    }

    /// Combine keyword counts and features into per-backend scores.
    fn determine_scores(
        &self,
        keyword_scores: &[(String, u32)],
        features: &PromptFeatures,
    ) -> Vec<(String, f64)> {
        let mut scores: Vec<(String, f64)> = keyword_scores
            .iter()
            .map(|(key, count)| (key.clone(), *count as f64 * KEYWORD_WEIGHT))
            .collect();

        // Capability-weighted boost for each backend's declared capabilities.
        for (key, score) in scores.iter_mut() {
            let Some(descriptor) = self.registry.get(key) else { continue };
            let boost: f64 = descriptor
                .capabilities
                .iter()
                .map(|capability| features.capability(*capability))
                .filter(|feature_score| *feature_score > 0.0)
                .map(|feature_score| feature_score * CAPABILITY_WEIGHT)
                .sum();
            *score += boost;
        }

        // Backend-specific heuristics. The numeric constants are load-bearing:
        // the regression tests pin them.
        for (key, score) in scores.iter_mut() {
            match key.as_str() {
                // Local model: quick tasks, simple queries, basic math.
                "local" => {
                    if features.length < 0.2 && features.complexity_terms < 0.3 {
                        *score += 2.0;
                    }
                    if features.math_presence > 0.0 && features.code_presence == 0.0 {
                        *score += 1.5;
                    }
                    if features.length > 0.3 || features.complexity_terms > 0.4 {
                        *score *= (1.0 - features.length - features.complexity_terms).max(0.1);
                    }
                    if features.code_presence > 0.5 || features.code_snippet_count > 0.0 {
                        *score *= 0.3;
                    }
                }
                // OpenAI-class model: code, medium complexity, technical analysis.
                "openai" => {
                    if features.code_presence > 0.0 {
                        *score += 3.0 * features.code_presence;
                    }
                    if features.is_analysis > 0.0 {
                        *score += 2.0 * features.is_analysis;
                    }
                    if features.complexity_terms > 0.3 && features.complexity_terms < 0.7 {
                        *score += 1.5 * features.complexity_terms;
                    }
                    if features.length > 0.8 {
                        *score *= 0.9;
                    }
                }
                // Anthropic-class model: long documents, high complexity, deep reasoning.
                "anthropic" => {
                    if features.length > 0.5 {
                        *score += 2.0 * features.length;
                    }
                    if features.complexity_terms > 0.6 {
                        *score += 2.5 * features.complexity_terms;
                    }
                    if features.is_analysis > 0.5 && features.avg_word_length > 0.6 {
                        *score += 2.0;
                    }
                    if features.question_count > 0.5 {
                        *score += 1.0 * features.question_count;
                    }
                    if features.code_presence > 0.7 {
                        *score *= 0.9;
                    }
                }
                _ => {}
            }
        }

        for (_, score) in scores.iter_mut() {
            *score = score.max(SCORE_FLOOR);
        }

        scores
    }

    /// Apply priority, token-budget and capability gates from metadata.
    fn apply_metadata_adjustments(
        &self,
        scores: &[(String, f64)],
        metadata: &RequestMetadata,
    ) -> Vec<(String, f64)> {
        let mut adjusted: Vec<(String, f64)> = scores.to_vec();

        if let Some(priority) = metadata.priority {
            for (key, score) in adjusted.iter_mut() {
                let rank = self
                    .registry
                    .get(key)
                    .map(|d| d.priority.rank(priority))
                    .unwrap_or(2);
                *score *= match rank {
                    1 => 3.0,
                    2 => 1.5,
                    _ => 0.7,
                };
            }
        }

        if let Some(max_tokens) = metadata.max_tokens {
            for (key, score) in adjusted.iter_mut() {
                if let Some(descriptor) = self.registry.get(key) {
                    if max_tokens > descriptor.max_tokens {
                        *score *= 0.5;
                    }
                }
            }
        }

        for capability in &metadata.required_capabilities {
            for (key, score) in adjusted.iter_mut() {
                let supported = self
                    .registry
                    .get(key)
                    .map(|d| d.supports(*capability))
                    .unwrap_or(false);
                if !supported {
                    *score *= 0.2;
                }
            }
        }

        adjusted
    }

    // -- memo ---------------------------------------------------------------

    fn memo_key(&self, prompt: &str, metadata: &RequestMetadata) -> u64 {
        let head: String = prompt.chars().take(100).collect();

        // Only the fields that can change the outcome participate in the key.
        let mut relevant = serde_json::Map::new();
        if let Some(priority) = metadata.priority {
            relevant.insert("priority".into(), json!(priority.as_str()));
        }
        if let Some(model) = &metadata.model {
            relevant.insert("model".into(), json!(model));
        }
        if let Some(max_tokens) = metadata.max_tokens {
            relevant.insert("max_tokens".into(), json!(max_tokens));
        }
        if !metadata.required_capabilities.is_empty() {
            relevant.insert("required_capabilities".into(), json!(metadata.required_capabilities));
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        head.hash(&mut hasher);
        serde_json::Value::Object(relevant).to_string().hash(&mut hasher);
        hasher.finish()
    }

    fn memo_get(&self, key: u64) -> Option<(String, ClassificationResult)> {
        let mut memo = self.memo.lock().expect("classifier memo lock poisoned");
        let expired = match memo.get(&key) {
            Some(entry) if entry.at.elapsed() < MEMO_TTL => {
                let mut result = entry.result.clone();
                result.source = ClassificationSource::Cache;
                return Some((entry.selected.clone(), result));
            }
            Some(_) => true,
            None => false,
        };
        // TTL enforcement happens on read.
        if expired {
            memo.pop(&key);
        }
        None
    }

    fn memo_put(&self, key: u64, selected: String, result: ClassificationResult) {
        let mut memo = self.memo.lock().expect("classifier memo lock poisoned");
        memo.put(key, MemoEntry { at: Instant::now(), selected, result });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::registry::build_registry;

    fn classifier() -> PromptClassifier {
        let settings = Settings::default();
        let registry = Arc::new(build_registry(&settings));
        PromptClassifier::new(registry, settings.default_backend())
    }

    fn no_metadata() -> RequestMetadata {
        RequestMetadata::default()
    }

    // -----------------------------------------------------------------------
    // Feature extraction
    // -----------------------------------------------------------------------

    #[test]
    fn features_detect_fenced_code_blocks() {
        let c = classifier();
        let f = c.extract_features("```python\ndef f(): pass\n```");
        assert_eq!(f.code_presence, 1.0);
        assert!((f.code_snippet_count - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn features_detect_inline_backticks_and_code_words() {
        let c = classifier();
        assert_eq!(c.extract_features("use `map` here").code_presence, 1.0);
        assert_eq!(c.extract_features("a function that adds").code_presence, 1.0);
        assert_eq!(c.extract_features("a plain sentence").code_presence, 0.0);
    }

    #[test]
    fn features_normalize_length_and_counts() {
        let c = classifier();
        let f = c.extract_features(&"a".repeat(4000));
        assert_eq!(f.length, 1.0, "length caps at 1.0");

        let f = c.extract_features("one. two. three.");
        assert!((f.sentence_count - 3.0 / 20.0).abs() < 1e-9);

        let f = c.extract_features("why? how? really?");
        assert!((f.question_count - 3.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn features_detect_math_symbols() {
        let c = classifier();
        assert_eq!(c.extract_features("2 + 2").math_presence, 1.0);
        assert_eq!(c.extract_features("just words").math_presence, 0.0);
    }

    #[test]
    fn features_score_verbs_and_questions() {
        let c = classifier();
        let f = c.extract_features("Write a story about what happened");
        assert_eq!(f.is_instruction, 1.0);
        assert_eq!(f.is_question, 1.0);
        assert_eq!(f.is_analysis, 0.0);

        let f = c.extract_features("Investigate the anomaly");
        assert_eq!(f.is_analysis, 1.0);
    }

    #[test]
    fn vocabulary_diversity_is_capped_at_one() {
        let c = classifier();
        let f = c.extract_features("alpha beta gamma");
        assert!(f.vocabulary_diversity <= 1.0);
        assert!(f.vocabulary_diversity > 0.0);

        let repeated = c.extract_features(&"same same same same same same same same".to_string());
        assert!(repeated.vocabulary_diversity < f.vocabulary_diversity);
    }

    #[test]
    fn empty_prompt_yields_zero_word_features() {
        let c = classifier();
        let f = c.extract_features("");
        assert_eq!(f.avg_word_length, 0.0);
        assert_eq!(f.vocabulary_diversity, 0.0);
        assert_eq!(f.length, 0.0);
    }

    #[test]
    fn capability_patterns_score_matches() {
        let c = classifier();
        let f = c.extract_features("legal contract terms and obligations");
        assert!(f.capability(Capability::LegalAnalysis) > 0.5);
        assert_eq!(f.capability(Capability::CodeGeneration), 0.0);
    }

    // -----------------------------------------------------------------------
    // Keyword matching
    // -----------------------------------------------------------------------

    #[test]
    fn keyword_matches_are_whole_word_only() {
        let c = classifier();
        // "hi" must not match inside "this" or "history".
        let counts = c.count_keyword_matches("this history is long");
        let local = counts.iter().find(|(k, _)| k == "local").unwrap().1;
        assert_eq!(local, 0);

        let counts = c.count_keyword_matches("hi there");
        let local = counts.iter().find(|(k, _)| k == "local").unwrap().1;
        assert_eq!(local, 1);
    }

    #[test]
    fn keyword_matches_are_case_insensitive() {
        let c = classifier();
        let counts = c.count_keyword_matches("HELLO Hello hello");
        let local = counts.iter().find(|(k, _)| k == "local").unwrap().1;
        assert_eq!(local, 3);
    }

    #[test]
    fn multi_word_keywords_match_phrases() {
        let c = classifier();
        let counts = c.count_keyword_matches("please create file reports.txt");
        let local = counts.iter().find(|(k, _)| k == "local").unwrap().1;
        // "create file" and "help"? only "create file" matches here.
        assert_eq!(local, 1);
    }

    // -----------------------------------------------------------------------
    // Classification scenarios
    // -----------------------------------------------------------------------

    #[test]
    fn short_greeting_routes_to_local() {
        let c = classifier();
        let (selected, result) = c.classify("hello there", &no_metadata());
        assert_eq!(selected, "local");
        assert!(result.confidence > 0.5, "confidence was {}", result.confidence);
        assert_eq!(result.source, ClassificationSource::RuleBased);

        let keyword = &result.reasoning["keyword_matches"]["local"];
        assert!(keyword.as_u64().unwrap() >= 1);
    }

    #[test]
    fn fenced_code_routes_to_openai() {
        let c = classifier();
        let prompt = "```python\ndef f(): pass\n```\nPlease analyze this snippet";
        let (selected, result) = c.classify(prompt, &no_metadata());
        assert_eq!(selected, "openai");

        // Local's score was multiplied by 0.3 for the code block; it must be
        // well below openai's.
        let scores = &result.reasoning["adjusted_scores"];
        assert!(scores["openai"].as_f64().unwrap() > scores["local"].as_f64().unwrap());
    }

    #[test]
    fn long_complex_brief_routes_to_anthropic() {
        let c = classifier();
        let filler = "The undersigned parties agree to the provisions described herein. "
            .repeat(50);
        let prompt = format!(
            "{filler} Provide a comprehensive and thorough legal discussion. \
             Discuss and elaborate on every clause."
        );
        let (selected, _) = c.classify(&prompt, &no_metadata());
        assert_eq!(selected, "anthropic");
    }

    #[test]
    fn quality_priority_triples_rank_one_backends() {
        let c = classifier();
        let filler = "The undersigned parties agree to the provisions described herein. "
            .repeat(50);
        let prompt = format!("{filler} Provide a comprehensive and thorough legal discussion.");

        let plain = c.classify(&prompt, &no_metadata()).1;
        let meta = RequestMetadata {
            priority: Some(crate::types::Priority::Quality),
            ..Default::default()
        };
        let prioritized = c.classify(&prompt, &meta).1;

        let plain_score = plain.reasoning["adjusted_scores"]["anthropic"].as_f64().unwrap();
        let boosted = prioritized.reasoning["adjusted_scores"]["anthropic"].as_f64().unwrap();
        assert!((boosted - plain_score * 3.0).abs() < 1e-9);
    }

    #[test]
    fn metadata_override_selects_known_backend_with_full_confidence() {
        let c = classifier();
        let meta = RequestMetadata { model: Some("anthropic".into()), ..Default::default() };
        let (selected, result) = c.classify("hello", &meta);
        assert_eq!(selected, "anthropic");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.source, ClassificationSource::MetadataOverride);
    }

    #[test]
    fn unknown_model_override_falls_through_to_scoring() {
        let c = classifier();
        let meta = RequestMetadata { model: Some("gpt-99".into()), ..Default::default() };
        let (selected, result) = c.classify("hello there", &meta);
        assert_eq!(selected, "local");
        assert_eq!(result.source, ClassificationSource::RuleBased);
    }

    #[test]
    fn featureless_prompt_falls_back_to_default_backend() {
        // ~800 chars of words that trip no keyword, verb, question, math or
        // complexity patterns: local's short-prompt bonus is disabled by the
        // length penalty, and nothing else scores.
        let c = classifier();
        let prompt = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod "
            .repeat(12);
        assert!(prompt.len() > 700 && prompt.len() < 1000);

        let (selected, result) = c.classify(&prompt, &no_metadata());
        assert_eq!(selected, "openai", "configured default backend wins on all-floor scores");
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn required_capability_gate_penalizes_unsupporting_backends() {
        let c = classifier();
        let meta = RequestMetadata {
            required_capabilities: vec![Capability::LegalAnalysis],
            ..Default::default()
        };
        // A prompt local would otherwise win.
        let (_, result) = c.classify("hello there", &meta);
        let scores = &result.reasoning["adjusted_scores"];
        let raw = &result.reasoning["model_scores"];
        // local and openai lack legal_analysis: multiplied by 0.2.
        assert!(
            (scores["local"].as_f64().unwrap()
                - raw["local"].as_f64().unwrap() * 0.2)
                .abs()
                < 1e-9
        );
        assert_eq!(
            scores["anthropic"].as_f64().unwrap(),
            raw["anthropic"].as_f64().unwrap()
        );
    }

    #[test]
    fn token_budget_gate_halves_small_backends() {
        let c = classifier();
        let meta = RequestMetadata { max_tokens: Some(50_000), ..Default::default() };
        let (_, result) = c.classify("hello there", &meta);
        let scores = &result.reasoning["adjusted_scores"];
        let raw = &result.reasoning["model_scores"];
        // Only local's 4096-token ceiling is below the request.
        assert!(
            (scores["local"].as_f64().unwrap() - raw["local"].as_f64().unwrap() * 0.5).abs()
                < 1e-9
        );
        assert_eq!(scores["openai"], raw["openai"]);
    }

    // -----------------------------------------------------------------------
    // Memo
    // -----------------------------------------------------------------------

    #[test]
    fn memo_serves_repeat_classifications_as_cache_source() {
        let c = classifier();
        let (first, first_result) = c.classify("hello there", &no_metadata());
        assert_eq!(first_result.source, ClassificationSource::RuleBased);

        let (second, second_result) = c.classify("hello there", &no_metadata());
        assert_eq!(first, second);
        assert_eq!(second_result.source, ClassificationSource::Cache);
        assert_eq!(second_result.confidence, first_result.confidence);
    }

    #[test]
    fn memo_key_depends_on_relevant_metadata_only() {
        let c = classifier();
        let base = no_metadata();
        let with_request_id = RequestMetadata {
            request_id: Some("req_x".into()),
            ..Default::default()
        };
        assert_eq!(c.memo_key("hello", &base), c.memo_key("hello", &with_request_id));

        let with_priority = RequestMetadata {
            priority: Some(crate::types::Priority::Speed),
            ..Default::default()
        };
        assert_ne!(c.memo_key("hello", &base), c.memo_key("hello", &with_priority));
    }

    #[test]
    fn memo_key_uses_first_hundred_chars() {
        let c = classifier();
        let long_a = format!("{}{}", "x".repeat(100), "tail one");
        let long_b = format!("{}{}", "x".repeat(100), "tail two");
        assert_eq!(
            c.memo_key(&long_a, &no_metadata()),
            c.memo_key(&long_b, &no_metadata())
        );
    }
}
