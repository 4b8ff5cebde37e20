//! Configuration parsing and validation.
//!
//! Mimic is configured via a TOML file (default: `config/mimic.toml`).
//! Only `[db]` is required; every other section falls back to the
//! defaults below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/mimic.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! model = "gpt-4o-mini"
//!
//! [rerank]
//! provider = "cohere"
//! ```
//!
//! # Validation
//!
//! [`load_config`] rejects:
//! - `chunking.chunk_size == 0`, or `overlap_words >= chunk_size`
//! - `retrieval.rrf_weight` outside `[0.0, 1.0]`
//! - `retrieval.distance_cutoff` outside `[-1.0, 1.0]`
//! - `llm.reserved_output_tokens >= llm.context_length`
//! - unknown embedding, rerank or LLM providers
//! - a network embedding provider without a `model`

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mimic_core::chunk::ChunkingParams;
use mimic_core::qa::QaParams;
use mimic_core::retrieval::RetrievalParams;
use mimic_core::style::StyleParams;
use mimic_core::verify::VerifyParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub style: StyleConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
    #[serde(default = "default_blurb_size")]
    pub blurb_size: usize,
    #[serde(default = "default_mini_chunk_size")]
    pub mini_chunk_size: usize,
    #[serde(default)]
    pub enable_mini_chunks: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_words: default_overlap_words(),
            blurb_size: default_blurb_size(),
            mini_chunk_size: default_mini_chunk_size(),
            enable_mini_chunks: false,
        }
    }
}

fn default_chunk_size() -> usize {
    8000
}
fn default_overlap_words() -> usize {
    5
}
fn default_blurb_size() -> usize {
    500
}
fn default_mini_chunk_size() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_embed_batch_size(),
            max_retries: default_embed_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    /// True for providers that call a remote model.
    pub fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    mimic_core::embedding::DOC_EMBEDDING_DIM
}
fn default_embed_batch_size() -> usize {
    8
}
fn default_embed_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Records per index write transaction.
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    /// Documents per batch yielded by built-in connectors.
    #[serde(default = "default_document_batch_size")]
    pub document_batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            write_batch_size: default_write_batch_size(),
            document_batch_size: default_document_batch_size(),
        }
    }
}

fn default_write_batch_size() -> usize {
    mimic_core::index::DEFAULT_BATCH_SIZE
}
fn default_document_batch_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_num_returned_hits")]
    pub num_returned_hits: usize,
    #[serde(default = "default_num_reranked_results")]
    pub num_reranked_results: usize,
    #[serde(default = "default_rrf_weight")]
    pub rrf_weight: f64,
    #[serde(default = "default_distance_cutoff")]
    pub distance_cutoff: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            num_returned_hits: default_num_returned_hits(),
            num_reranked_results: default_num_reranked_results(),
            rrf_weight: default_rrf_weight(),
            distance_cutoff: default_distance_cutoff(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_num_returned_hits() -> usize {
    100
}
fn default_num_reranked_results() -> usize {
    15
}
fn default_rrf_weight() -> f64 {
    0.5
}
fn default_distance_cutoff() -> f64 {
    mimic_core::index::SEARCH_DISTANCE_CUTOFF
}
fn default_candidate_multiplier() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_provider_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rerank_api_key_env")]
    pub api_key_env: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: default_rerank_model(),
            url: default_rerank_url(),
            timeout_secs: default_rerank_timeout_secs(),
            max_retries: default_provider_max_retries(),
            api_key_env: default_rerank_api_key_env(),
        }
    }
}

fn default_rerank_provider() -> String {
    "disabled".to_string()
}
fn default_rerank_model() -> String {
    "rerank-english-v3.0".to_string()
}
fn default_rerank_url() -> String {
    "https://api.cohere.com/v1/rerank".to_string()
}
fn default_rerank_timeout_secs() -> u64 {
    10
}
fn default_provider_max_retries() -> u32 {
    3
}
fn default_rerank_api_key_env() -> String {
    "COHERE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_reserved_output_tokens")]
    pub reserved_output_tokens: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_provider_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
    /// Environment variable holding the API key. Unset or empty means no
    /// `Authorization` header (local servers).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            context_length: default_context_length(),
            reserved_output_tokens: default_reserved_output_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_provider_max_retries(),
            temperature: 0.0,
            api_key_env: default_llm_api_key_env(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_context_length() -> usize {
    4096
}
fn default_reserved_output_tokens() -> usize {
    1024
}
fn default_llm_timeout_secs() -> u64 {
    10
}
fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QaConfig {
    #[serde(default = "default_quote_prefix_chars")]
    pub quote_prefix_chars: usize,
    #[serde(default = "default_verify_max_tokens")]
    pub verify_max_tokens: usize,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            quote_prefix_chars: default_quote_prefix_chars(),
            verify_max_tokens: default_verify_max_tokens(),
        }
    }
}

fn default_quote_prefix_chars() -> usize {
    mimic_core::qa::quotes::DEFAULT_QUOTE_PREFIX_CHARS
}
fn default_verify_max_tokens() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct StyleConfig {
    #[serde(default = "default_min_chat_pairs")]
    pub min_chat_pairs: usize,
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_not_sure_message")]
    pub not_sure_message: String,
    /// Most recent chat pairs loaded per user for rephrasing.
    #[serde(default = "default_max_pairs_loaded")]
    pub max_pairs_loaded: usize,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            min_chat_pairs: default_min_chat_pairs(),
            max_prompt_tokens: default_max_prompt_tokens(),
            not_sure_message: default_not_sure_message(),
            max_pairs_loaded: default_max_pairs_loaded(),
        }
    }
}

fn default_min_chat_pairs() -> usize {
    5
}
fn default_max_prompt_tokens() -> usize {
    3000
}
fn default_not_sure_message() -> String {
    "I'm not sure".to_string()
}
fn default_max_pairs_loaded() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    10
}

impl Config {
    pub fn chunking_params(&self) -> ChunkingParams {
        ChunkingParams {
            chunk_size: self.chunking.chunk_size,
            overlap_words: self.chunking.overlap_words,
            blurb_size: self.chunking.blurb_size,
            mini_chunk_size: self.chunking.mini_chunk_size,
            enable_mini_chunks: self.chunking.enable_mini_chunks,
        }
    }

    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            num_returned_hits: self.retrieval.num_returned_hits,
            num_reranked_results: self.retrieval.num_reranked_results,
            rrf_weight: self.retrieval.rrf_weight,
            distance_cutoff: self.retrieval.distance_cutoff,
            candidate_multiplier: self.retrieval.candidate_multiplier,
        }
    }

    pub fn qa_params(&self) -> QaParams {
        QaParams {
            context_length: self.llm.context_length,
            reserved_output_tokens: self.llm.reserved_output_tokens,
            temperature: self.llm.temperature,
            timeout: self.llm.timeout(),
            quote_prefix_chars: self.qa.quote_prefix_chars,
        }
    }

    pub fn verify_params(&self) -> VerifyParams {
        VerifyParams {
            token_budget: self
                .llm
                .context_length
                .saturating_sub(self.qa.verify_max_tokens),
            max_tokens: self.qa.verify_max_tokens,
            timeout: self.llm.timeout(),
        }
    }

    pub fn style_params(&self) -> StyleParams {
        StyleParams {
            min_chat_pairs: self.style.min_chat_pairs,
            max_prompt_tokens: self.style.max_prompt_tokens,
            not_sure_message: self.style.not_sure_message.clone(),
            timeout: self.llm.timeout(),
            ..StyleParams::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.chunk_size {
        bail!("chunking.overlap_words must be < chunking.chunk_size");
    }
    if config.chunking.enable_mini_chunks && config.chunking.mini_chunk_size == 0 {
        bail!("chunking.mini_chunk_size must be > 0 when mini-chunks are enabled");
    }

    // Validate retrieval
    if config.retrieval.num_returned_hits == 0 {
        bail!("retrieval.num_returned_hits must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.rrf_weight) {
        bail!("retrieval.rrf_weight must be in [0.0, 1.0]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.distance_cutoff) {
        bail!("retrieval.distance_cutoff must be in [-1.0, 1.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }
    if config.embedding.is_remote() && config.embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.provider != "disabled" && config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate providers
    match config.rerank.provider.as_str() {
        "disabled" | "cohere" => {}
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled or cohere.",
            other
        ),
    }
    match config.llm.provider.as_str() {
        "openai" => {}
        other => bail!("Unknown llm provider: '{}'. Must be openai.", other),
    }
    if config.llm.reserved_output_tokens >= config.llm.context_length {
        bail!("llm.reserved_output_tokens must be < llm.context_length");
    }

    if config.indexing.write_batch_size == 0 || config.indexing.document_batch_size == 0 {
        bail!("indexing batch sizes must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/mimic.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 8000);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.batch_size, 8);
        assert_eq!(config.retrieval.num_reranked_results, 15);
        assert_eq!(config.llm.timeout_secs, 10);
        assert_eq!(config.style.not_sure_message, "I'm not sure");
        assert_eq!(config.qa_params().prompt_budget(), 3072);
    }

    #[test]
    fn test_rejects_bad_rrf_weight() {
        let err = parse_config("[db]\npath = \"x\"\n[retrieval]\nrrf_weight = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("rrf_weight"));
    }

    #[test]
    fn test_rejects_overlap_not_below_chunk_size() {
        let err = parse_config("[db]\npath = \"x\"\n[chunking]\nchunk_size = 5\noverlap_words = 5\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap_words"));
    }

    #[test]
    fn test_rejects_reserved_tokens_over_context() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[llm]\ncontext_length = 1000\nreserved_output_tokens = 1000\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("reserved_output_tokens"));
    }

    #[test]
    fn test_remote_embedding_requires_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
        assert!(parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"word2vec\"\n").is_err());
    }

    #[test]
    fn test_params_mapping() {
        let config = parse_config(
            "[db]\npath = \"x\"\n[chunking]\nenable_mini_chunks = true\n[qa]\nverify_max_tokens = 32\n",
        )
        .unwrap();
        assert!(config.chunking_params().enable_mini_chunks);
        let verify = config.verify_params();
        assert_eq!(verify.max_tokens, 32);
        assert_eq!(verify.token_budget, 4096 - 32);
        assert_eq!(config.style_params().min_chat_pairs, 5);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/mimic.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.retrieval.num_reranked_results, 15);
        assert_eq!(config.style.not_sure_message, "I'm not sure");
    }
}
