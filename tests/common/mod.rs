#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vibewatch::{
    config::Config,
    error::{AppError, AppResult, FailureKind},
    services::{
        embedding_builder::BuilderSettings,
        index_build::{embed_catalog, normalize_catalog, IndexPaths},
        providers::{EmbeddingModel, GenerationModel, HashingEmbedder, Prompt},
    },
};

pub const SCENARIO_CSV: &str = "movieId,title,genres\n\
1,Up (2009),Family\n\
2,Saw (2004),Horror\n\
3,Amelie (2001),Romance\n";

/// Hashing embedder reporting a chosen model id
pub struct NamedEmbedder {
    inner: HashingEmbedder,
    model_id: String,
    pub calls: AtomicUsize,
}

impl NamedEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            inner: HashingEmbedder::new(64),
            model_id: model_id.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EmbeddingModel for NamedEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_batch(texts).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn name(&self) -> &'static str {
        "named"
    }
}

/// Generation model with a canned reply
pub enum StubGenerator {
    Reply(String),
    Fail(FailureKind),
}

#[async_trait::async_trait]
impl GenerationModel for StubGenerator {
    async fn generate(&self, _prompt: &Prompt) -> AppResult<String> {
        match self {
            StubGenerator::Reply(text) => Ok(text.clone()),
            StubGenerator::Fail(kind) => Err(AppError::generation(*kind, "stubbed failure")),
        }
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

pub fn test_config() -> Config {
    envy::from_iter(vec![
        ("EMBEDDING_PROVIDER".to_string(), "hashing".to_string()),
        ("EMBED_MAX_RETRIES".to_string(), "0".to_string()),
    ])
    .unwrap()
}

/// Writes `csv` to `dir`, then normalizes and embeds it with `embedder`
pub async fn build_index(dir: &Path, csv: &str, embedder: Arc<dyn EmbeddingModel>) -> IndexPaths {
    let source = dir.join("movies.csv");
    std::fs::write(&source, csv).unwrap();

    let paths = IndexPaths::in_dir(dir);
    normalize_catalog(&source, &paths).unwrap();
    embed_catalog(&paths, embedder, BuilderSettings::default())
        .await
        .unwrap();
    paths
}

/// `n` records titled "Movie 1".."Movie n"
pub fn numbered_csv(n: u64) -> String {
    let mut csv = String::from("movieId,title,genres\n");
    for id in 1..=n {
        csv.push_str(&format!("{},Movie {},Drama\n", id, id));
    }
    csv
}
