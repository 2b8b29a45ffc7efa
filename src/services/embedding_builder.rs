//! Offline embedding of the normalized catalog into an index artifact.
//!
//! Records are embedded in batches bounded by count and by payload size, with
//! a bounded number of batches in flight. Every finished batch is appended to
//! a checkpoint, so an interrupted build resumes where it stopped. Vectors
//! whose `(id, content hash, model)` match the previous index or the
//! checkpoint are reused instead of re-embedded.

use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    db::{read_checkpoint, CheckpointEntry, CheckpointWriter, IndexArtifact, IndexManifest, INDEX_FORMAT_VERSION},
    error::{AppError, AppResult, FailureKind},
    models::{Catalog, CatalogId, COMPOSITE_TEXT_VERSION},
    services::{
        providers::{with_retry, EmbeddingModel, RetryPolicy},
        vector_index::Metric,
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuilderSettings {
    /// Maximum records per embedding request
    pub batch_size: usize,
    /// Maximum characters per embedding request
    pub max_batch_chars: usize,
    /// Maximum requests in flight
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_batch_chars: 100_000,
            concurrency: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl BuilderSettings {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
        }
    }
}

/// A built artifact and how much of it was actually embedded
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact: IndexArtifact,
    pub reused: usize,
    pub embedded: usize,
    pub batches: usize,
}

pub struct EmbeddingBuilder {
    model: Arc<dyn EmbeddingModel>,
    settings: BuilderSettings,
}

struct Batch {
    positions: Vec<usize>,
    texts: Vec<String>,
}

impl EmbeddingBuilder {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: BuilderSettings) -> Self {
        Self { model, settings }
    }

    /// Embeds every record of `catalog` and returns the artifact, rows in
    /// catalog order. Nothing is written except checkpoint lines; the caller
    /// persists the artifact and then removes the checkpoint.
    #[tracing::instrument(skip_all, fields(records = catalog.len()))]
    pub async fn build(
        &self,
        catalog: &Catalog,
        previous: Option<&IndexArtifact>,
        checkpoint_path: &Path,
    ) -> AppResult<BuildOutcome> {
        if catalog.is_empty() {
            return Err(AppError::Catalog(
                "Cannot build an index from an empty catalog".to_string(),
            ));
        }

        let model_id = self.model.model_id().to_string();
        let mut reusable = self.reusable_vectors(previous, checkpoint_path)?;

        let records = catalog.records();
        let hashes: Vec<String> = records.iter().map(|r| r.content_hash()).collect();
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; records.len()];
        let mut pending = Vec::new();

        for (position, record) in records.iter().enumerate() {
            match reusable.remove(&(record.id, hashes[position].clone())) {
                Some(vector) => vectors[position] = Some(vector),
                None => pending.push(position),
            }
        }

        let reused = records.len() - pending.len();
        let batches = self.plan_batches(catalog, &pending);
        let batch_count = batches.len();

        tracing::info!(
            provider = self.model.name(),
            embedding_model = %model_id,
            records = records.len(),
            reused,
            to_embed = pending.len(),
            batches = batch_count,
            "Starting embedding build"
        );

        if !batches.is_empty() {
            let mut checkpoint = CheckpointWriter::open(checkpoint_path)?;
            let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
            let policy = self.settings.retry_policy();
            let mut join_set = JoinSet::new();

            for batch in batches {
                let model = Arc::clone(&self.model);
                let semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::Internal(format!("Embedding semaphore closed: {}", e)))?;
                    let embedded = embed_splitting(model.as_ref(), &batch.texts, policy).await?;
                    Ok::<_, AppError>((batch.positions, embedded))
                });
            }

            let mut completed = 0usize;
            while let Some(joined) = join_set.join_next().await {
                let result = joined
                    .map_err(|e| AppError::Internal(format!("Embedding task failed: {}", e)))
                    .and_then(|outcome| outcome);

                let (positions, embedded) = match result {
                    Ok(done) => done,
                    Err(e) => {
                        join_set.abort_all();
                        tracing::error!(
                            error = %e,
                            completed_batches = completed,
                            "Embedding build failed; finished batches are kept in the checkpoint"
                        );
                        return Err(e);
                    }
                };

                let mut entries = Vec::with_capacity(positions.len());
                for (position, vector) in positions.into_iter().zip(embedded) {
                    let record = &records[position];
                    if let Err(e) = check_vector(record.id, &vector) {
                        join_set.abort_all();
                        return Err(e);
                    }
                    entries.push(CheckpointEntry {
                        embedding_model: model_id.clone(),
                        id: record.id,
                        content_hash: hashes[position].clone(),
                        vector: vector.clone(),
                    });
                    vectors[position] = Some(vector);
                }
                checkpoint.append(&entries)?;

                completed += 1;
                tracing::debug!(completed, total = batch_count, "Embedding batch finished");
            }
        }

        let vectors: Vec<Vec<f32>> = vectors
            .into_iter()
            .zip(records)
            .map(|(vector, record)| {
                vector.ok_or_else(|| {
                    AppError::Internal(format!("Record {} was never embedded", record.id))
                })
            })
            .collect::<AppResult<_>>()?;

        let dimension = vectors.first().map(Vec::len).unwrap_or_default();
        if let Some((position, vector)) = vectors
            .iter()
            .enumerate()
            .find(|(_, v)| v.len() != dimension)
        {
            return Err(AppError::embedding(
                FailureKind::Fatal,
                format!(
                    "Record {} embedded with dimension {} (expected {})",
                    records[position].id,
                    vector.len(),
                    dimension
                ),
            ));
        }

        let artifact = IndexArtifact {
            manifest: IndexManifest {
                format_version: INDEX_FORMAT_VERSION,
                embedding_model: model_id,
                text_format: COMPOSITE_TEXT_VERSION.to_string(),
                metric: Metric::Cosine,
                dimension,
                count: vectors.len(),
                catalog_fingerprint: catalog.fingerprint(),
                built_at: Utc::now(),
            },
            ids: records.iter().map(|r| r.id).collect(),
            content_hashes: hashes,
            vectors,
        };
        artifact.validate()?;

        let embedded = artifact.manifest.count - reused;
        tracing::info!(
            rows = artifact.manifest.count,
            dimension,
            reused,
            embedded,
            "Embedding build finished"
        );

        Ok(BuildOutcome {
            artifact,
            reused,
            embedded,
            batches: batch_count,
        })
    }

    /// Vectors that are still valid for the current model, keyed by
    /// `(id, content hash)`. Checkpoint entries win over the previous index.
    fn reusable_vectors(
        &self,
        previous: Option<&IndexArtifact>,
        checkpoint_path: &Path,
    ) -> AppResult<HashMap<(CatalogId, String), Vec<f32>>> {
        let model_id = self.model.model_id();
        let mut reusable = HashMap::new();

        if let Some(previous) = previous {
            let manifest = &previous.manifest;
            if manifest.embedding_model == model_id && manifest.text_format == COMPOSITE_TEXT_VERSION {
                for ((id, hash), vector) in previous
                    .ids
                    .iter()
                    .zip(&previous.content_hashes)
                    .zip(&previous.vectors)
                {
                    reusable.insert((*id, hash.clone()), vector.clone());
                }
            } else {
                tracing::info!(
                    previous_model = %manifest.embedding_model,
                    previous_text_format = %manifest.text_format,
                    "Previous index uses a different embedding contract; re-embedding everything"
                );
            }
        }

        let mut resumed = 0usize;
        for entry in read_checkpoint(checkpoint_path)? {
            if entry.embedding_model == model_id {
                reusable.insert((entry.id, entry.content_hash), entry.vector);
                resumed += 1;
            }
        }
        if resumed > 0 {
            tracing::info!(resumed, path = %checkpoint_path.display(), "Resuming from checkpoint");
        }

        Ok(reusable)
    }

    /// Groups pending positions into batches of at most `batch_size` records
    /// and `max_batch_chars` characters. An oversized record gets a batch of its own.
    fn plan_batches(&self, catalog: &Catalog, pending: &[usize]) -> Vec<Batch> {
        let records = catalog.records();
        let mut batches = Vec::new();
        let mut current = Batch {
            positions: Vec::new(),
            texts: Vec::new(),
        };
        let mut current_chars = 0usize;

        for &position in pending {
            let text = records[position].composite_text();
            let chars = text.chars().count();
            let full = current.positions.len() >= self.settings.batch_size
                || current_chars + chars > self.settings.max_batch_chars;

            if full && !current.positions.is_empty() {
                batches.push(std::mem::replace(
                    &mut current,
                    Batch {
                        positions: Vec::new(),
                        texts: Vec::new(),
                    },
                ));
                current_chars = 0;
            }

            current.positions.push(position);
            current.texts.push(text.to_string());
            current_chars += chars;
        }

        if !current.positions.is_empty() {
            batches.push(current);
        }
        batches
    }
}

/// Embeds `texts` in order, halving any request the service rejects as too large
async fn embed_splitting(
    model: &dyn EmbeddingModel,
    texts: &[String],
    policy: RetryPolicy,
) -> AppResult<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    // Stack of chunks; the left half is pushed last so order is preserved
    let mut stack: Vec<&[String]> = vec![texts];

    while let Some(chunk) = stack.pop() {
        match with_retry(policy, "embed_batch", || model.embed_batch(chunk)).await {
            Ok(batch) if batch.len() == chunk.len() => vectors.extend(batch),
            Ok(batch) => {
                return Err(AppError::embedding(
                    FailureKind::Fatal,
                    format!("Expected {} vectors, got {}", chunk.len(), batch.len()),
                ))
            }
            Err(AppError::PayloadTooLarge(message)) if chunk.len() > 1 => {
                let (left, right) = chunk.split_at(chunk.len() / 2);
                tracing::warn!(
                    batch_size = chunk.len(),
                    error = %message,
                    "Embedding payload too large, splitting batch"
                );
                stack.push(right);
                stack.push(left);
            }
            Err(AppError::PayloadTooLarge(message)) => {
                return Err(AppError::PayloadTooLarge(format!(
                    "A single record exceeds the embedding payload limit: {}",
                    message
                )))
            }
            Err(e) => return Err(e),
        }
    }

    Ok(vectors)
}

fn check_vector(id: CatalogId, vector: &[f32]) -> AppResult<()> {
    if vector.is_empty() {
        return Err(AppError::embedding(
            FailureKind::Fatal,
            format!("Empty vector returned for record {}", id),
        ));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(AppError::embedding(
            FailureKind::Fatal,
            format!("Non-finite vector returned for record {}", id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogRecord;
    use crate::services::providers::HashingEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hashing embedder that counts calls and can be told to misbehave
    struct ScriptedEmbedder {
        inner: HashingEmbedder,
        model_id: String,
        calls: AtomicUsize,
        texts: AtomicUsize,
        /// Batches larger than this are rejected as too large
        max_texts: usize,
        /// Calls after this many succeed fail fatally
        fail_after: Option<usize>,
    }

    impl ScriptedEmbedder {
        fn new(model_id: &str) -> Self {
            Self {
                inner: HashingEmbedder::new(16),
                model_id: model_id.to_string(),
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
                max_texts: usize::MAX,
                fail_after: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl EmbeddingModel for ScriptedEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.len() > self.max_texts {
                return Err(AppError::PayloadTooLarge("413".to_string()));
            }
            if self.fail_after.is_some_and(|limit| call >= limit) {
                return Err(AppError::embedding(FailureKind::Fatal, "401"));
            }
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn catalog(n: u64) -> Catalog {
        let records = (1..=n)
            .map(|id| {
                CatalogRecord::new(
                    CatalogId(id),
                    format!("Movie {}", id),
                    format!("Synopsis number {}", id),
                    vec!["Drama".to_string()],
                    None,
                    None,
                )
            })
            .collect();
        Catalog::from_records(records).unwrap()
    }

    fn settings(batch_size: usize) -> BuilderSettings {
        BuilderSettings {
            batch_size,
            max_batch_chars: 100_000,
            concurrency: 2,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_build_embeds_every_record_in_catalog_order() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedEmbedder::new("m1"));
        let builder = EmbeddingBuilder::new(model.clone(), settings(3));

        let catalog = catalog(10);
        let outcome = builder
            .build(&catalog, None, &dir.path().join("ckpt.jsonl"))
            .await
            .unwrap();

        let artifact = &outcome.artifact;
        assert_eq!(artifact.manifest.count, 10);
        assert_eq!(artifact.manifest.dimension, 16);
        assert_eq!(artifact.manifest.embedding_model, "m1");
        assert_eq!(artifact.manifest.text_format, COMPOSITE_TEXT_VERSION);
        assert_eq!(artifact.manifest.catalog_fingerprint, catalog.fingerprint());
        assert_eq!(artifact.ids, (1..=10).map(CatalogId).collect::<Vec<_>>());
        assert_eq!(outcome.batches, 4);
        assert_eq!(model.texts.load(Ordering::SeqCst), 10);

        let expected = HashingEmbedder::new(16).embed_text(catalog.records()[4].composite_text());
        assert_eq!(artifact.vectors[4], expected);
    }

    #[tokio::test]
    async fn test_rebuild_reuses_previous_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("ckpt.jsonl");
        let catalog = catalog(5);

        let first = EmbeddingBuilder::new(Arc::new(ScriptedEmbedder::new("m1")), settings(2))
            .build(&catalog, None, &checkpoint)
            .await
            .unwrap();
        std::fs::remove_file(&checkpoint).unwrap();

        let model = Arc::new(ScriptedEmbedder::new("m1"));
        let second = EmbeddingBuilder::new(model.clone(), settings(2))
            .build(&catalog, Some(&first.artifact), &checkpoint)
            .await
            .unwrap();

        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.reused, 5);
        assert_eq!(second.artifact.vectors, first.artifact.vectors);
        assert_eq!(second.artifact.ids, first.artifact.ids);
    }

    #[tokio::test]
    async fn test_changed_model_re_embeds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("ckpt.jsonl");
        let catalog = catalog(4);

        let first = EmbeddingBuilder::new(Arc::new(ScriptedEmbedder::new("v1")), settings(4))
            .build(&catalog, None, &checkpoint)
            .await
            .unwrap();

        let model = Arc::new(ScriptedEmbedder::new("v2"));
        let second = EmbeddingBuilder::new(model.clone(), settings(4))
            .build(&catalog, Some(&first.artifact), &checkpoint)
            .await
            .unwrap();

        assert_eq!(second.reused, 0);
        assert_eq!(model.texts.load(Ordering::SeqCst), 4);
        assert_eq!(second.artifact.manifest.embedding_model, "v2");
    }

    #[tokio::test]
    async fn test_interrupted_build_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("ckpt.jsonl");
        let catalog = catalog(6);

        let mut failing = ScriptedEmbedder::new("m1");
        failing.fail_after = Some(1);
        let failing_settings = BuilderSettings {
            concurrency: 1,
            ..settings(2)
        };
        let result = EmbeddingBuilder::new(Arc::new(failing), failing_settings)
            .build(&catalog, None, &checkpoint)
            .await;
        assert!(result.is_err());

        let saved = read_checkpoint(&checkpoint).unwrap();
        assert_eq!(saved.len(), 2);

        let model = Arc::new(ScriptedEmbedder::new("m1"));
        let outcome = EmbeddingBuilder::new(model.clone(), settings(2))
            .build(&catalog, None, &checkpoint)
            .await
            .unwrap();

        assert_eq!(outcome.reused, 2);
        assert_eq!(model.texts.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.artifact.manifest.count, 6);
    }

    #[tokio::test]
    async fn test_payload_too_large_splits_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ScriptedEmbedder::new("m1");
        model.max_texts = 2;
        let model = Arc::new(model);

        let outcome = EmbeddingBuilder::new(model.clone(), settings(8))
            .build(&catalog(8), None, &dir.path().join("ckpt.jsonl"))
            .await
            .unwrap();

        assert_eq!(outcome.artifact.manifest.count, 8);
        assert_eq!(model.texts.load(Ordering::SeqCst), 8);
        // 8 → 4+4 → 2+2+2+2: one rejected 8, two rejected 4s, four accepted 2s
        assert_eq!(model.calls.load(Ordering::SeqCst), 7);

        let expected = HashingEmbedder::new(16);
        let records = catalog(8);
        for (row, record) in records.records().iter().enumerate() {
            assert_eq!(outcome.artifact.vectors[row], expected.embed_text(record.composite_text()));
        }
    }

    #[tokio::test]
    async fn test_single_oversized_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ScriptedEmbedder::new("m1");
        model.max_texts = 0;

        let result = EmbeddingBuilder::new(Arc::new(model), settings(4))
            .build(&catalog(2), None, &dir.path().join("ckpt.jsonl"))
            .await;

        assert!(matches!(result, Err(AppError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn test_empty_catalog_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = EmbeddingBuilder::new(Arc::new(ScriptedEmbedder::new("m1")), settings(4))
            .build(&Catalog::default(), None, &dir.path().join("ckpt.jsonl"))
            .await;
        assert!(matches!(result, Err(AppError::Catalog(_))));
    }

    #[test]
    fn test_plan_batches_respects_char_budget() {
        let builder = EmbeddingBuilder::new(
            Arc::new(ScriptedEmbedder::new("m1")),
            BuilderSettings {
                max_batch_chars: 60,
                ..settings(100)
            },
        );
        let catalog = catalog(6);
        let pending: Vec<usize> = (0..6).collect();
        let batches = builder.plan_batches(&catalog, &pending);

        assert!(batches.len() > 1);
        let flattened: Vec<usize> = batches.iter().flat_map(|b| b.positions.clone()).collect();
        assert_eq!(flattened, pending);
        for batch in &batches {
            let chars: usize = batch.texts.iter().map(|t| t.chars().count()).sum();
            assert!(chars <= 60 || batch.texts.len() == 1);
        }
    }

    #[test]
    fn test_check_vector_rejects_non_finite() {
        assert!(check_vector(CatalogId(1), &[1.0, f32::NAN]).is_err());
        assert!(check_vector(CatalogId(1), &[]).is_err());
        assert!(check_vector(CatalogId(1), &[0.5, 0.5]).is_ok());
    }
}
