use std::sync::Arc;

use crate::{
    error::{AppError, AppResult, FailureKind},
    models::Candidate,
    services::{
        index_store::IndexStore,
        providers::{with_retry, EmbeddingModel, RetryPolicy},
    },
};

/// Embeds a free-text query and returns the nearest catalog records
pub struct Retriever {
    store: Arc<IndexStore>,
    embedder: Arc<dyn EmbeddingModel>,
    retry: RetryPolicy,
}

impl Retriever {
    pub fn new(store: Arc<IndexStore>, embedder: Arc<dyn EmbeddingModel>, retry: RetryPolicy) -> Self {
        Self {
            store,
            embedder,
            retry,
        }
    }

    /// Top `min(k, n)` candidates by similarity, best first.
    ///
    /// Input is validated before any model call.
    pub async fn retrieve(&self, query_text: &str, k: i64) -> AppResult<Vec<Candidate>> {
        let query = query_text.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput("query_text must not be empty".to_string()));
        }
        if k <= 0 {
            return Err(AppError::InvalidInput(format!("k must be positive (got {})", k)));
        }

        let snapshot = self.store.snapshot()?;
        if snapshot.manifest.embedding_model != self.embedder.model_id() {
            return Err(AppError::IndexUnavailable(format!(
                "Index was built with embedding model '{}' but queries are embedded with '{}'",
                snapshot.manifest.embedding_model,
                self.embedder.model_id()
            )));
        }

        let texts = [query.to_string()];
        let mut vectors = with_retry(self.retry, "embed_query", || self.embedder.embed_batch(&texts)).await?;
        let vector = match (vectors.pop(), vectors.is_empty()) {
            (Some(vector), true) => vector,
            _ => {
                return Err(AppError::embedding(
                    FailureKind::Fatal,
                    "Expected exactly one vector for the query",
                ))
            }
        };

        let k = usize::try_from(k).unwrap_or(usize::MAX);
        let hits = snapshot.index.search(&vector, k)?;

        let candidates = hits
            .into_iter()
            .map(|hit| {
                snapshot
                    .catalog
                    .get(hit.id)
                    .cloned()
                    .map(|record| Candidate {
                        record,
                        score: hit.score,
                    })
                    .ok_or_else(|| {
                        AppError::Internal(format!("Index row {} has no catalog record", hit.id))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;

        tracing::debug!(query = %query, "Query embedded");
        tracing::info!(
            k,
            returned = candidates.len(),
            top_score = candidates.first().map(|c| c.score).unwrap_or_default(),
            "Candidates retrieved"
        );

        Ok(candidates)
    }
}
