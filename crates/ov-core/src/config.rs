//! Configuration types and loader.
//!
//! One record per component, every field defaulted, resolved through a
//! three-level chain: explicit path, `OPENVIKING_CONFIG_FILE`, then
//! `~/.openviking/ov.conf`.

use crate::error::{OvError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OpenVikingConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Vector database settings.
    #[serde(default)]
    pub vectordb: VectorDbConfig,
    /// Embedding model settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Queue and worker settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Parser settings.
    #[serde(default)]
    pub parser: ParserConfig,
    /// Retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Per-call-site timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Request trace settings.
    #[serde(default)]
    pub trace: TraceConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Workspace root; AGFS data lives under `<root>/agfs`, vectors under
    /// `<root>/vectors`.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// AGFS backend choice (currently "local").
    #[serde(default = "default_agfs_backend")]
    pub backend: String,
}

/// Vector database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorDbConfig {
    /// Index backend: "flat" or "hnsw".
    #[serde(default = "default_vector_backend")]
    pub backend: String,
}

/// Embedding model configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Vector dimension.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Provider endpoint (opaque to the engine).
    #[serde(default)]
    pub endpoint: String,
    /// Model name.
    #[serde(default)]
    pub model: String,
}

/// Queue and worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Directory jobs processed concurrently.
    #[serde(default = "default_semantic_jobs")]
    pub max_concurrent_semantic_jobs: usize,
    /// Summariser calls in flight within one directory job.
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrent_llm: usize,
    /// Embedding jobs coalesced into one provider call.
    #[serde(default = "default_embedding_batch")]
    pub embedding_batch_size: usize,
    /// Seconds before an `in_progress` lease expires and the job reverts
    /// to `pending`.
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    /// Grace period before an orphaned scratch tree is collected.
    #[serde(default = "default_scratch_grace")]
    pub scratch_gc_grace_secs: u64,
}

/// How code files are summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeSummaryMode {
    /// Structural skeleton is the abstract; no LLM call.
    #[default]
    Ast,
    /// Always summarise via LLM.
    Llm,
    /// Skeleton passed to the LLM as context.
    AstLlm,
}

/// Parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParserConfig {
    #[serde(default)]
    pub code_summary_mode: CodeSummaryMode,
    /// Sections above this many tokens split further.
    #[serde(default = "default_split_max")]
    pub split_max_tokens: usize,
    /// Adjacent sections below this combined size merge.
    #[serde(default = "default_split_min")]
    pub merge_min_tokens: usize,
    /// Images per summariser call.
    #[serde(default = "default_images_per_call")]
    pub max_images_per_call: usize,
    /// Sections per summariser call.
    #[serde(default = "default_sections_per_call")]
    pub max_sections_per_call: usize,
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Results below this score are dropped by `find`.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// A shortlist root with more children than this gets its own
    /// scoped search pass.
    #[serde(default = "default_route_fanout")]
    pub route_fanout: usize,
}

/// Per-call-site timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "default_summarizer_timeout")]
    pub summarizer_secs: u64,
    #[serde(default = "default_embedder_timeout")]
    pub embedder_secs: u64,
    #[serde(default = "default_agfs_timeout")]
    pub agfs_op_secs: u64,
    #[serde(default = "default_search_timeout")]
    pub vector_search_secs: u64,
}

impl TimeoutConfig {
    pub fn summarizer(&self) -> Duration {
        Duration::from_secs(self.summarizer_secs)
    }
    pub fn embedder(&self) -> Duration {
        Duration::from_secs(self.embedder_secs)
    }
    pub fn agfs_op(&self) -> Duration {
        Duration::from_secs(self.agfs_op_secs)
    }
    pub fn vector_search(&self) -> Duration {
        Duration::from_secs(self.vector_search_secs)
    }
}

/// Request trace configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceConfig {
    /// Events kept per request before truncation.
    #[serde(default = "default_trace_events")]
    pub max_events: usize,
}

// --- Defaults ---
fn default_workspace_root() -> PathBuf { PathBuf::from("./openviking") }
fn default_agfs_backend() -> String { "local".into() }
fn default_vector_backend() -> String { "hnsw".into() }
fn default_dimension() -> usize { 1024 }
fn default_semantic_jobs() -> usize { 10 }
fn default_llm_concurrency() -> usize { 10 }
fn default_embedding_batch() -> usize { 32 }
fn default_lease_timeout() -> u64 { 600 }
fn default_scratch_grace() -> u64 { 3600 }
fn default_split_max() -> usize { 1024 }
fn default_split_min() -> usize { 512 }
fn default_images_per_call() -> usize { 10 }
fn default_sections_per_call() -> usize { 20 }
fn default_score_threshold() -> f32 { 0.3 }
fn default_route_fanout() -> usize { 8 }
fn default_summarizer_timeout() -> u64 { 180 }
fn default_embedder_timeout() -> u64 { 60 }
fn default_agfs_timeout() -> u64 { 30 }
fn default_search_timeout() -> u64 { 10 }
fn default_trace_events() -> usize { 1000 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            backend: default_agfs_backend(),
        }
    }
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self { backend: default_vector_backend() }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            endpoint: String::new(),
            model: String::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_semantic_jobs: default_semantic_jobs(),
            max_concurrent_llm: default_llm_concurrency(),
            embedding_batch_size: default_embedding_batch(),
            lease_timeout_secs: default_lease_timeout(),
            scratch_gc_grace_secs: default_scratch_grace(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            code_summary_mode: CodeSummaryMode::default(),
            split_max_tokens: default_split_max(),
            merge_min_tokens: default_split_min(),
            max_images_per_call: default_images_per_call(),
            max_sections_per_call: default_sections_per_call(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            route_fanout: default_route_fanout(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            summarizer_secs: default_summarizer_timeout(),
            embedder_secs: default_embedder_timeout(),
            agfs_op_secs: default_agfs_timeout(),
            vector_search_secs: default_search_timeout(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { max_events: default_trace_events() }
    }
}

// --- Loader ---

const OPENVIKING_CONFIG_ENV: &str = "OPENVIKING_CONFIG_FILE";
const DEFAULT_OV_CONF: &str = "ov.conf";

/// Default config directory: `~/.openviking/`.
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openviking")
}

/// Resolve a config file path: explicit path, then env var, then
/// `~/.openviking/ov.conf`. Returns `None` when nothing exists.
pub fn resolve_config_path(explicit_path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        let path = PathBuf::from(p);
        return path.exists().then_some(path);
    }
    if let Ok(val) = std::env::var(OPENVIKING_CONFIG_ENV) {
        let path = PathBuf::from(val);
        return path.exists().then_some(path);
    }
    let path = default_config_dir().join(DEFAULT_OV_CONF);
    path.exists().then_some(path)
}

/// Load configuration through the resolution chain; defaults when no
/// file is found.
pub fn load_config(explicit_path: Option<&str>) -> Result<OpenVikingConfig> {
    match resolve_config_path(explicit_path) {
        Some(path) => load_config_file(&path),
        None => Ok(OpenVikingConfig::default()),
    }
}

/// Load and validate a specific config file.
pub fn load_config_file(path: &Path) -> Result<OpenVikingConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OvError::invalid(format!("cannot read config {}: {e}", path.display())))?;
    let config: OpenVikingConfig = serde_json::from_str(&content)
        .map_err(|e| OvError::invalid(format!("invalid config JSON in {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate a configuration record.
pub fn validate_config(config: &OpenVikingConfig) -> Result<()> {
    if config.embedding.dimension == 0 {
        return Err(OvError::invalid("embedding.dimension must be > 0"));
    }
    if config.queue.max_concurrent_semantic_jobs == 0 {
        return Err(OvError::invalid("queue.max_concurrent_semantic_jobs must be > 0"));
    }
    if config.queue.max_concurrent_llm == 0 {
        return Err(OvError::invalid("queue.max_concurrent_llm must be > 0"));
    }
    if config.queue.embedding_batch_size == 0 {
        return Err(OvError::invalid("queue.embedding_batch_size must be > 0"));
    }
    if config.parser.split_max_tokens <= config.parser.merge_min_tokens {
        return Err(OvError::invalid(
            "parser.split_max_tokens must exceed parser.merge_min_tokens",
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_threshold) {
        return Err(OvError::invalid("retrieval.score_threshold must be in [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OpenVikingConfig::default();
        assert_eq!(cfg.queue.max_concurrent_semantic_jobs, 10);
        assert_eq!(cfg.queue.max_concurrent_llm, 10);
        assert_eq!(cfg.queue.embedding_batch_size, 32);
        assert_eq!(cfg.queue.lease_timeout_secs, 600);
        assert_eq!(cfg.parser.split_max_tokens, 1024);
        assert_eq!(cfg.parser.merge_min_tokens, 512);
        assert_eq!(cfg.parser.max_images_per_call, 10);
        assert_eq!(cfg.parser.max_sections_per_call, 20);
        assert_eq!(cfg.parser.code_summary_mode, CodeSummaryMode::Ast);
        assert_eq!(cfg.retrieval.score_threshold, 0.3);
        assert_eq!(cfg.timeouts.summarizer_secs, 180);
        assert_eq!(cfg.timeouts.embedder_secs, 60);
        assert_eq!(cfg.timeouts.agfs_op_secs, 30);
        assert_eq!(cfg.timeouts.vector_search_secs, 10);
        assert_eq!(cfg.embedding.dimension, 1024);
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = OpenVikingConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: OpenVikingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, cfg2);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"queue": {"max_concurrent_semantic_jobs": 2}}"#;
        let cfg: OpenVikingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.queue.max_concurrent_semantic_jobs, 2);
        assert_eq!(cfg.queue.embedding_batch_size, 32);
        assert_eq!(cfg.embedding.dimension, 1024);
    }

    #[test]
    fn test_empty_json_is_default() {
        let cfg: OpenVikingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, OpenVikingConfig::default());
    }

    #[test]
    fn test_code_summary_mode_serde() {
        assert_eq!(serde_json::to_string(&CodeSummaryMode::Ast).unwrap(), r#""ast""#);
        assert_eq!(serde_json::to_string(&CodeSummaryMode::AstLlm).unwrap(), r#""ast_llm""#);
        let m: CodeSummaryMode = serde_json::from_str(r#""llm""#).unwrap();
        assert_eq!(m, CodeSummaryMode::Llm);
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate_config(&OpenVikingConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_dimension() {
        let mut cfg = OpenVikingConfig::default();
        cfg.embedding.dimension = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut cfg = OpenVikingConfig::default();
        cfg.queue.max_concurrent_semantic_jobs = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_split_thresholds() {
        let mut cfg = OpenVikingConfig::default();
        cfg.parser.split_max_tokens = 100;
        cfg.parser.merge_min_tokens = 200;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_threshold_range() {
        let mut cfg = OpenVikingConfig::default();
        cfg.retrieval.score_threshold = 1.5;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_resolve_explicit_missing() {
        assert!(resolve_config_path(Some("/nonexistent/ov.conf")).is_none());
    }

    #[test]
    fn test_load_missing_falls_back_to_default() {
        let cfg = load_config(Some("/nonexistent/ov.conf")).unwrap();
        assert_eq!(cfg, OpenVikingConfig::default());
    }

    #[test]
    fn test_timeout_durations() {
        let t = TimeoutConfig::default();
        assert_eq!(t.summarizer(), Duration::from_secs(180));
        assert_eq!(t.vector_search(), Duration::from_secs(10));
    }
}
