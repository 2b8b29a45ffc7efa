//! Model service abstraction
//!
//! The embedding and generation models sit behind traits so the offline build,
//! the retriever and the composer can run against OpenAI-compatible APIs, the
//! local hashing embedder, or test doubles. The embedding model used at query
//! time must be the one the index was built with; `model_id` is the contract.
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    config::Config,
    error::{AppError, AppResult},
};

pub mod hashing;
pub mod openai;

pub use hashing::HashingEmbedder;
pub use openai::{OpenAiChat, OpenAiEmbeddings};

/// Text → fixed-dimension vector
#[async_trait::async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embeds `texts` in order, returning exactly one vector per text.
    ///
    /// Fails with `PayloadTooLarge` when the service rejects the request size,
    /// so callers can split the batch instead of dropping records.
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    /// Identifier stored with the index and checked at load and query time
    fn model_id(&self) -> &str;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// A bounded, single-turn chat prompt
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Size in characters, the unit of the prompt cap
    pub fn char_len(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

/// Bounded prompt → free-form text
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GenerationModel: Send + Sync {
    /// One completion call. Failures are `GenerationService` errors tagged
    /// transient or fatal.
    async fn generate(&self, prompt: &Prompt) -> AppResult<String>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Exponential backoff for transient model-service failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

/// Runs `call` until it succeeds, fails with a non-transient error, or
/// `policy.max_retries` retries have been spent.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Builds the embedding model named by `EMBEDDING_PROVIDER`
pub fn create_embedding_model(config: &Config) -> AppResult<Arc<dyn EmbeddingModel>> {
    match config.embedding_provider.to_lowercase().as_str() {
        "openai" => {
            let api_key = require_api_key(config)?;
            let model = OpenAiEmbeddings::new(
                api_key,
                config.openai_api_url.clone(),
                config.embedding_model.clone(),
                config.embedding_timeout(),
            )?;
            Ok(Arc::new(model))
        }
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.hashing_dimensions))),
        other => Err(AppError::Internal(format!(
            "Unknown EMBEDDING_PROVIDER '{}' (expected 'openai' or 'hashing')",
            other
        ))),
    }
}

pub fn create_generation_model(config: &Config) -> AppResult<Arc<dyn GenerationModel>> {
    let api_key = require_api_key(config)?;
    let model = OpenAiChat::new(
        api_key,
        config.openai_api_url.clone(),
        config.generation_model.clone(),
        config.generation_temperature,
        config.generation_timeout(),
    )?;
    Ok(Arc::new(model))
}

fn require_api_key(config: &Config) -> AppResult<String> {
    config
        .openai_api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Internal("OPENAI_API_KEY is not set".to_string()))
}
