use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    config::Config,
    error::AppResult,
    models::RecommendationResponse,
    services::{
        composer::Composer,
        index_store::IndexStore,
        providers::{EmbeddingModel, GenerationModel, RetryPolicy},
        retriever::Retriever,
    },
};

/// Generates mood-based movie recommendations
///
/// Retrieves the catalog records nearest to the user's free-text context and
/// lets the generation model pick and explain the best fits among them.
pub struct RecommendationService {
    retriever: Retriever,
    composer: Composer,
    default_k: i64,
}

impl RecommendationService {
    pub fn new(retriever: Retriever, composer: Composer, default_k: i64) -> Self {
        Self {
            retriever,
            composer,
            default_k,
        }
    }

    /// Wires the service from configuration, sharing `store` with the caller
    pub fn with_models(
        config: &Config,
        store: Arc<IndexStore>,
        embedder: Arc<dyn EmbeddingModel>,
        generator: Arc<dyn GenerationModel>,
    ) -> Self {
        tracing::info!(
            embedding_provider = embedder.name(),
            embedding_model = %embedder.model_id(),
            generation_provider = generator.name(),
            "Recommendation service ready"
        );
        let retry = RetryPolicy {
            max_retries: config.embed_max_retries,
            base_delay: Duration::from_millis(config.embed_retry_base_ms),
        };
        Self::new(
            Retriever::new(store, embedder, retry),
            Composer::new(generator, config.composer_settings()),
            config.default_k,
        )
    }

    pub fn default_k(&self) -> i64 {
        self.default_k
    }

    /// Runs retrieval then composition for one request. `k` falls back to
    /// the configured default when absent.
    #[tracing::instrument(skip(self, query_text))]
    pub async fn recommend(&self, query_text: &str, k: Option<i64>) -> AppResult<RecommendationResponse> {
        let started = Instant::now();
        let k = k.unwrap_or(self.default_k);

        let candidates = self.retriever.retrieve(query_text, k).await?;
        let composition = self.composer.compose(query_text, candidates).await?;
        let response = RecommendationResponse::from(composition);

        tracing::info!(
            k,
            returned = response.recommendations.len(),
            degraded = response.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recommendation request served"
        );

        Ok(response)
    }
}
