use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::services::{composer::ComposerSettings, embedding_builder::BuilderSettings};

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Raw catalog export (CSV or JSON) read by the normalizer
    #[serde(default = "default_raw_catalog_path")]
    pub raw_catalog_path: PathBuf,

    /// Normalized catalog table
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Index artifact (manifest + id mapping + vectors)
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Scratch file for resumable embedding builds
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// `openai` or `hashing`
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Vector width of the local hashing embedder
    #[serde(default = "default_hashing_dimensions")]
    pub hashing_dimensions: usize,

    /// OpenAI API key, required by the `openai` providers
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[serde(default = "default_openai_api_url")]
    pub openai_api_url: String,

    #[serde(default = "default_generation_model")]
    pub generation_model: String,

    #[serde(default = "default_generation_temperature")]
    pub generation_temperature: f32,

    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,

    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    /// Payload ceiling for one embedding request, in characters
    #[serde(default = "default_embed_max_batch_chars")]
    pub embed_max_batch_chars: usize,

    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,

    #[serde(default = "default_embed_max_retries")]
    pub embed_max_retries: u32,

    #[serde(default = "default_embed_retry_base_ms")]
    pub embed_retry_base_ms: u64,

    /// Hard cap on the size of a generation prompt, in characters
    #[serde(default = "default_prompt_max_chars")]
    pub prompt_max_chars: usize,

    #[serde(default = "default_synopsis_excerpt_chars")]
    pub synopsis_excerpt_chars: usize,

    #[serde(default = "default_query_max_chars")]
    pub query_max_chars: usize,

    /// Result count used when a request omits `k`
    #[serde(default = "default_k")]
    pub default_k: i64,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_raw_catalog_path() -> PathBuf {
    PathBuf::from("data/movies_clean.csv")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/catalog.json")
}

fn default_index_path() -> PathBuf {
    PathBuf::from("data/index.json")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/index.checkpoint.jsonl")
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_hashing_dimensions() -> usize {
    256
}

fn default_openai_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o".to_string()
}

fn default_generation_temperature() -> f32 {
    0.7
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

fn default_embed_batch_size() -> usize {
    64
}

fn default_embed_max_batch_chars() -> usize {
    100_000
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_embed_max_retries() -> u32 {
    3
}

fn default_embed_retry_base_ms() -> u64 {
    500
}

fn default_prompt_max_chars() -> usize {
    12_000
}

fn default_synopsis_excerpt_chars() -> usize {
    280
}

fn default_query_max_chars() -> usize {
    1_000
}

fn default_k() -> i64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn builder_settings(&self) -> BuilderSettings {
        BuilderSettings {
            batch_size: self.embed_batch_size.max(1),
            max_batch_chars: self.embed_max_batch_chars.max(1),
            concurrency: self.embed_concurrency.max(1),
            max_retries: self.embed_max_retries,
            retry_base_delay: Duration::from_millis(self.embed_retry_base_ms),
        }
    }

    pub fn composer_settings(&self) -> ComposerSettings {
        ComposerSettings {
            timeout: self.generation_timeout(),
            prompt_max_chars: self.prompt_max_chars,
            synopsis_excerpt_chars: self.synopsis_excerpt_chars,
            query_max_chars: self.query_max_chars,
        }
    }
}
