//! Loading and publishing the in-memory index.
//!
//! A snapshot is the catalog, the vector index and the manifest that ties
//! them together. Snapshots are immutable and swapped in whole, so a request
//! always searches one consistent snapshot even while a reload is publishing
//! the next one.

use arc_swap::ArcSwapOption;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::{
    db::{read_catalog, read_index, IndexManifest},
    error::{AppError, AppResult},
    models::{Catalog, COMPOSITE_TEXT_VERSION},
    services::vector_index::{Metric, VectorIndex},
};

#[derive(Debug)]
pub struct IndexSnapshot {
    pub index: VectorIndex,
    pub catalog: Catalog,
    pub manifest: IndexManifest,
}

/// The embedding contract the running service requires of an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpectation {
    pub embedding_model: String,
    pub text_format: String,
    pub metric: Metric,
}

impl IndexExpectation {
    pub fn for_model(embedding_model: &str) -> Self {
        Self {
            embedding_model: embedding_model.to_string(),
            text_format: COMPOSITE_TEXT_VERSION.to_string(),
            metric: Metric::Cosine,
        }
    }
}

/// Reads the catalog table and index file and checks that they belong
/// together and match `expectation`. Any mismatch is `IndexUnavailable`.
pub fn load_snapshot(
    catalog_path: &Path,
    index_path: &Path,
    expectation: &IndexExpectation,
) -> AppResult<IndexSnapshot> {
    let catalog = read_catalog(catalog_path)?;
    let artifact = read_index(index_path)?;
    let manifest = artifact.manifest.clone();

    if manifest.embedding_model != expectation.embedding_model {
        return Err(AppError::IndexUnavailable(format!(
            "Index was built with embedding model '{}' but the service embeds queries with '{}'; rebuild the index",
            manifest.embedding_model, expectation.embedding_model
        )));
    }
    if manifest.text_format != expectation.text_format {
        return Err(AppError::IndexUnavailable(format!(
            "Index text format '{}' does not match '{}'; rebuild the index",
            manifest.text_format, expectation.text_format
        )));
    }
    if manifest.metric != expectation.metric {
        return Err(AppError::IndexUnavailable(format!(
            "Index metric '{}' does not match '{}'",
            manifest.metric, expectation.metric
        )));
    }
    if manifest.catalog_fingerprint != catalog.fingerprint() {
        return Err(AppError::IndexUnavailable(
            "Index was built from a different catalog than the one on disk; rebuild the index".to_string(),
        ));
    }

    // The fingerprint covers content; check coverage explicitly as well
    let indexed: HashSet<_> = artifact.ids.iter().copied().collect();
    if artifact.ids.len() != catalog.len() || !catalog.records().iter().all(|r| indexed.contains(&r.id)) {
        return Err(AppError::IndexUnavailable(format!(
            "Index covers {} rows but the catalog has {} records",
            artifact.ids.len(),
            catalog.len()
        )));
    }

    let index = VectorIndex::build(artifact.vectors, artifact.ids, manifest.metric)?;

    tracing::info!(
        rows = index.len(),
        dimension = index.dimension(),
        embedding_model = %manifest.embedding_model,
        built_at = %manifest.built_at,
        "Index snapshot loaded"
    );

    Ok(IndexSnapshot {
        index,
        catalog,
        manifest,
    })
}

/// Holder of the currently published snapshot
#[derive(Debug, Default)]
pub struct IndexStore {
    current: ArcSwapOption<IndexSnapshot>,
}

impl IndexStore {
    pub fn empty() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    pub fn with_snapshot(snapshot: IndexSnapshot) -> Self {
        let store = Self::empty();
        store.publish(snapshot);
        store
    }

    /// Atomically replaces the published snapshot. In-flight requests keep
    /// the snapshot they already hold.
    pub fn publish(&self, snapshot: IndexSnapshot) {
        let rows = snapshot.index.len();
        let previous = self.current.swap(Some(Arc::new(snapshot)));
        tracing::info!(rows, replaced = previous.is_some(), "Index snapshot published");
    }

    pub fn current(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.load_full()
    }

    /// The published snapshot, or `IndexUnavailable` before the first load
    pub fn snapshot(&self) -> AppResult<Arc<IndexSnapshot>> {
        self.current().ok_or_else(|| {
            AppError::IndexUnavailable("No index is loaded; build one with `build_index all`".to_string())
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }
}
