//! Offline pipeline: raw catalog → normalized catalog table → index file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    config::Config,
    db::{read_catalog, read_index, remove_checkpoint, write_catalog, write_index},
    error::{AppError, AppResult},
    services::{
        embedding_builder::{BuildOutcome, BuilderSettings, EmbeddingBuilder},
        normalizer::{normalize, read_raw_rows, NormalizeReport},
        providers::EmbeddingModel,
    },
};

/// Where the catalog table, index file and build checkpoint live
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPaths {
    pub catalog: PathBuf,
    pub index: PathBuf,
    pub checkpoint: PathBuf,
}

impl IndexPaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            catalog: config.catalog_path.clone(),
            index: config.index_path.clone(),
            checkpoint: config.checkpoint_path.clone(),
        }
    }

    /// `catalog.json`, `index.json` and `index.checkpoint.jsonl` under `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            catalog: dir.join("catalog.json"),
            index: dir.join("index.json"),
            checkpoint: dir.join("index.checkpoint.jsonl"),
        }
    }
}

/// Normalizes `source` and writes the catalog table
pub fn normalize_catalog(source: &Path, paths: &IndexPaths) -> AppResult<NormalizeReport> {
    let rows = read_raw_rows(source)?;
    let report = normalize(rows)?;
    if report.catalog.is_empty() {
        return Err(AppError::Catalog(format!(
            "No usable records in {} ({} rows read)",
            source.display(),
            report.total_rows
        )));
    }

    write_catalog(&paths.catalog, &report.catalog)?;
    Ok(report)
}

/// Embeds the catalog table and atomically replaces the index file.
///
/// Vectors of the existing index are reused where still valid. The
/// checkpoint is removed only after the new index is on disk.
pub async fn embed_catalog(
    paths: &IndexPaths,
    model: Arc<dyn EmbeddingModel>,
    settings: BuilderSettings,
) -> AppResult<BuildOutcome> {
    let catalog = read_catalog(&paths.catalog)?;

    let previous = match read_index(&paths.index) {
        Ok(artifact) => Some(artifact),
        Err(e) => {
            tracing::info!(reason = %e, "No reusable previous index");
            None
        }
    };

    let outcome = EmbeddingBuilder::new(model, settings)
        .build(&catalog, previous.as_ref(), &paths.checkpoint)
        .await?;

    write_index(&paths.index, &outcome.artifact)?;
    remove_checkpoint(&paths.checkpoint)?;
    Ok(outcome)
}
