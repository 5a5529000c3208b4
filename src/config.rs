//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults that
//! match a production deployment against an OpenAI-compatible gateway.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    10
}

/// Layout heuristics and window sizes used by [`crate::chunk`].
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_min_tokens")]
    pub target_min_tokens: usize,
    #[serde(default = "default_target_max_tokens")]
    pub target_max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    /// Fraction of page height treated as the header (top) or footer (bottom) band.
    #[serde(default = "default_edge_band")]
    pub edge_band: f32,
    /// Share of pages a band text must appear on to count as boilerplate.
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: f32,
    #[serde(default = "default_heading_ratio")]
    pub heading_ratio: f32,
    #[serde(default = "default_scanned_page_ratio")]
    pub scanned_page_ratio: f32,
    #[serde(default = "default_low_text_chars")]
    pub low_text_chars: usize,
    /// Virtual page size for formats without physical pages.
    #[serde(default = "default_page_split_chars")]
    pub page_split_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_min_tokens: default_target_min_tokens(),
            target_max_tokens: default_target_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_chunk_chars: default_min_chunk_chars(),
            edge_band: default_edge_band(),
            repeat_threshold: default_repeat_threshold(),
            heading_ratio: default_heading_ratio(),
            scanned_page_ratio: default_scanned_page_ratio(),
            low_text_chars: default_low_text_chars(),
            page_split_chars: default_page_split_chars(),
        }
    }
}

fn default_target_min_tokens() -> usize {
    150
}
fn default_target_max_tokens() -> usize {
    300
}
fn default_overlap_tokens() -> usize {
    50
}
fn default_min_chunk_chars() -> usize {
    50
}
fn default_edge_band() -> f32 {
    0.10
}
fn default_repeat_threshold() -> f32 {
    0.60
}
fn default_heading_ratio() -> f32 {
    1.3
}
fn default_scanned_page_ratio() -> f32 {
    0.70
}
fn default_low_text_chars() -> usize {
    50
}
fn default_page_split_chars() -> usize {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_multi_doc_top_k")]
    pub multi_doc_top_k: usize,
    /// Candidate multiplier applied to `top_k` before the length filter.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,
    #[serde(default = "default_min_chunk_text_len")]
    pub min_chunk_text_len: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            multi_doc_top_k: default_multi_doc_top_k(),
            overfetch: default_overfetch(),
            min_chunk_text_len: default_min_chunk_text_len(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_multi_doc_top_k() -> usize {
    8
}
fn default_overfetch() -> usize {
    3
}
fn default_min_chunk_text_len() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause between embedding batches of one document.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_embedding_model(),
            dims: default_dims(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_batch_delay_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_model")]
    pub default_model: String,
    /// Longest silence allowed between streamed chunks.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
            connect_timeout_secs: default_llm_connect_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Per-fragment character cap inside the system prompt.
    #[serde(default = "default_fragment_chars")]
    pub fragment_chars: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_continuations")]
    pub max_continuations: i64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_true")]
    pub refund_on_disconnect: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            fragment_chars: default_fragment_chars(),
            snippet_chars: default_snippet_chars(),
            heartbeat_secs: default_heartbeat_secs(),
            max_continuations: default_max_continuations(),
            channel_capacity: default_channel_capacity(),
            refund_on_disconnect: true,
        }
    }
}

fn default_history_turns() -> usize {
    6
}
fn default_fragment_chars() -> usize {
    1400
}
fn default_snippet_chars() -> usize {
    80
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_max_continuations() -> i64 {
    3
}
fn default_channel_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CreditsConfig {
    #[serde(default = "default_min_balance_for_chat")]
    pub min_balance_for_chat: i64,
    #[serde(default = "default_free_monthly")]
    pub free_monthly: i64,
    #[serde(default = "default_plus_monthly")]
    pub plus_monthly: i64,
    #[serde(default = "default_pro_monthly")]
    pub pro_monthly: i64,
    #[serde(default = "default_quick_multiplier")]
    pub quick_multiplier: f64,
    #[serde(default = "default_balanced_multiplier")]
    pub balanced_multiplier: f64,
    #[serde(default = "default_thorough_multiplier")]
    pub thorough_multiplier: f64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            min_balance_for_chat: default_min_balance_for_chat(),
            free_monthly: default_free_monthly(),
            plus_monthly: default_plus_monthly(),
            pro_monthly: default_pro_monthly(),
            quick_multiplier: default_quick_multiplier(),
            balanced_multiplier: default_balanced_multiplier(),
            thorough_multiplier: default_thorough_multiplier(),
        }
    }
}

fn default_min_balance_for_chat() -> i64 {
    100
}
fn default_free_monthly() -> i64 {
    5000
}
fn default_plus_monthly() -> i64 {
    30000
}
fn default_pro_monthly() -> i64 {
    150000
}
fn default_quick_multiplier() -> f64 {
    0.5
}
fn default_balanced_multiplier() -> f64 {
    1.0
}
fn default_thorough_multiplier() -> f64 {
    3.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ocr_languages")]
    pub languages: String,
    #[serde(default = "default_ocr_dpi")]
    pub dpi: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            languages: default_ocr_languages(),
            dpi: default_ocr_dpi(),
        }
    }
}

fn default_ocr_languages() -> String {
    "eng+chi_sim".to_string()
}
fn default_ocr_dpi() -> u32 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parses and validates configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    // Validate chunking
    let c = &config.chunking;
    if c.target_min_tokens == 0 || c.target_min_tokens > c.target_max_tokens {
        anyhow::bail!("chunking.target_min_tokens must be in 1..=target_max_tokens");
    }
    for (name, v) in [
        ("chunking.edge_band", c.edge_band),
        ("chunking.repeat_threshold", c.repeat_threshold),
        ("chunking.scanned_page_ratio", c.scanned_page_ratio),
    ] {
        if !(v > 0.0 && v < 1.0) {
            anyhow::bail!("{} must be in (0.0, 1.0)", name);
        }
    }
    if c.heading_ratio <= 1.0 {
        anyhow::bail!("chunking.heading_ratio must be > 1.0");
    }
    if c.page_split_chars == 0 {
        anyhow::bail!("chunking.page_split_chars must be > 0");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 || config.retrieval.multi_doc_top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.overfetch < 1 {
        anyhow::bail!("retrieval.overfetch must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.chat.channel_capacity == 0 {
        anyhow::bail!("chat.channel_capacity must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/doctalk.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.target_min_tokens, 150);
        assert_eq!(config.chunking.target_max_tokens, 300);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.multi_doc_top_k, 8);
        assert_eq!(config.chat.heartbeat_secs, 15);
        assert_eq!(config.embedding.batch_size, 64);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn rejects_inverted_token_window() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[chunking]\ntarget_min_tokens = 400\ntarget_max_tokens = 300\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("target_min_tokens"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"magic\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn rejects_band_out_of_range() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[chunking]\nedge_band = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("edge_band"));
    }
}
