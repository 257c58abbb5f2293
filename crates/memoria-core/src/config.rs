use crate::review::RiskLevel;
use crate::{MemoriaError, MemoriaResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, usually loaded from `memoria.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoriaConfig {
    /// Root directory of the on-disk store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Embedder selection.
    #[serde(default)]
    pub embedder: EmbedderConfig,
    /// Vector index tuning.
    #[serde(default)]
    pub index: IndexConfig,
    /// Hybrid retrieval defaults.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Proposal workflow settings.
    #[serde(default)]
    pub proposals: ProposalConfig,
}

impl Default for MemoriaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedder: EmbedderConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            proposals: ProposalConfig::default(),
        }
    }
}

impl MemoriaConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(s: &str) -> MemoriaResult<Self> {
        let config: MemoriaConfig =
            toml::from_str(s).map_err(|e| MemoriaError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the engine misbehave.
    pub fn validate(&self) -> MemoriaResult<()> {
        if self.embedder.dimension == 0 {
            return Err(MemoriaError::Config(
                "embedder.dimension must be positive".to_string(),
            ));
        }
        if self.index.m < 2 {
            return Err(MemoriaError::Config("index.m must be at least 2".to_string()));
        }
        if self.index.ef_construction < self.index.m {
            return Err(MemoriaError::Config(
                "index.ef_construction must be >= index.m".to_string(),
            ));
        }
        if self.index.rebuild_segment_size == 0 {
            return Err(MemoriaError::Config(
                "index.rebuild_segment_size must be positive".to_string(),
            ));
        }
        let w = &self.retrieval;
        if w.vector_weight < 0.0 || w.lexical_weight < 0.0 {
            return Err(MemoriaError::Config(
                "retrieval weights must be non-negative".to_string(),
            ));
        }
        if w.vector_weight + w.lexical_weight <= 0.0 {
            return Err(MemoriaError::Config(
                "at least one retrieval weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Embedder selection. The lexical projection is always available; the
/// neural endpoint is negotiated once at startup when configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Dimension of the lexical projection.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Optional neural encoder endpoint.
    #[serde(default)]
    pub neural: Option<NeuralEmbedderConfig>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            neural: None,
        }
    }
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralEmbedderConfig {
    /// Base URL, e.g. `http://localhost:11434`.
    pub endpoint: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Bearer token, if the endpoint requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Expected output dimension; the startup probe rejects mismatches.
    pub dimension: usize,
    /// Per-request timeout.
    #[serde(default = "default_neural_timeout_ms")]
    pub timeout_ms: u64,
}

/// Vector index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Use the proximity graph when it passes its self-test.
    #[serde(default = "default_true")]
    pub ann_enabled: bool,
    /// Max neighbors per node on upper layers (layer 0 uses `2 * m`).
    #[serde(default = "default_m")]
    pub m: usize,
    /// Candidate list breadth during construction.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Candidate list breadth during search (raised to `k` when smaller).
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Below this many live vectors searches use the exact scan.
    #[serde(default = "default_exact_threshold")]
    pub exact_threshold: usize,
    /// Compact once tombstones exceed this fraction of live vectors.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f32,
    /// Records per cancellable rebuild segment.
    #[serde(default = "default_rebuild_segment_size")]
    pub rebuild_segment_size: usize,
    /// Seed for level assignment.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ann_enabled: true,
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            exact_threshold: default_exact_threshold(),
            compaction_ratio: default_compaction_ratio(),
            rebuild_segment_size: default_rebuild_segment_size(),
            seed: default_seed(),
        }
    }
}

/// Hybrid retrieval defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight of the normalized vector score.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    /// Weight of the normalized lexical score.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    /// Each source contributes `k * candidate_multiplier` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Result count when the caller does not specify one.
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            lexical_weight: default_lexical_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            default_k: default_k(),
        }
    }
}

/// Proposal workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Proposals whose items are all strictly below this level auto-approve.
    #[serde(default = "default_auto_approve_below")]
    pub auto_approve_below: RiskLevel,
    /// Bound on a single reviewer lookup.
    #[serde(default = "default_review_timeout_ms")]
    pub review_timeout_ms: u64,
    /// Backoff applied to timed-out reviewer lookups.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Prior outcomes attached as context to a new proposal.
    #[serde(default = "default_context_k")]
    pub context_k: usize,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            auto_approve_below: default_auto_approve_below(),
            review_timeout_ms: default_review_timeout_ms(),
            retry: RetryPolicy::default(),
            context_k: default_context_k(),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_dimension() -> usize {
    256
}
fn default_neural_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}
fn default_exact_threshold() -> usize {
    256
}
fn default_compaction_ratio() -> f32 {
    0.2
}
fn default_rebuild_segment_size() -> usize {
    512
}
fn default_seed() -> u64 {
    0x6d65_6d6f_7269_61
}
fn default_vector_weight() -> f32 {
    0.7
}
fn default_lexical_weight() -> f32 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_k() -> usize {
    10
}
fn default_auto_approve_below() -> RiskLevel {
    RiskLevel::Medium
}
fn default_review_timeout_ms() -> u64 {
    30_000
}
fn default_context_k() -> usize {
    3
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = MemoriaConfig::from_toml_str("").unwrap();
        assert_eq!(config.embedder.dimension, 256);
        assert_eq!(config.index.m, 16);
        assert!((config.retrieval.vector_weight - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.proposals.auto_approve_below, RiskLevel::Medium);
    }

    #[test]
    fn test_partial_override() {
        let config = MemoriaConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/memoria"

            [index]
            exact_threshold = 10

            [proposals]
            auto_approve_below = "high"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/memoria"));
        assert_eq!(config.index.exact_threshold, 10);
        assert_eq!(config.index.ef_search, 64);
        assert_eq!(config.proposals.auto_approve_below, RiskLevel::High);
    }

    #[test]
    fn test_rejects_zero_weights() {
        let err = MemoriaConfig::from_toml_str(
            r#"
            [retrieval]
            vector_weight = 0.0
            lexical_weight = 0.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MemoriaError::Config(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.backoff_ms(0), 100);
        assert_eq!(policy.backoff_ms(1), 200);
        assert_eq!(policy.backoff_ms(3), 800);
        assert_eq!(policy.backoff_ms(4), 1_000);
        assert_eq!(policy.backoff_ms(40), 1_000);
    }
}
