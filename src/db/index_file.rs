use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::{
    db::write_json_atomic,
    error::{AppError, AppResult},
    models::CatalogId,
    services::vector_index::Metric,
};

/// Layout version of the index file itself
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// The embedding contract and provenance of an index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    pub format_version: u32,
    /// Identifier of the embedding model the vectors came from
    pub embedding_model: String,
    /// Version of the composite-text layout that was embedded
    pub text_format: String,
    pub metric: Metric,
    pub dimension: usize,
    pub count: usize,
    /// Fingerprint of the catalog table the index was built from
    pub catalog_fingerprint: String,
    pub built_at: DateTime<Utc>,
}

/// The persisted index: manifest, row → id mapping, and the raw vector matrix.
///
/// Row `i` of `vectors` belongs to `ids[i]` and was embedded from text whose
/// SHA-256 is `content_hashes[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexArtifact {
    pub manifest: IndexManifest,
    pub ids: Vec<CatalogId>,
    pub content_hashes: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
}

impl IndexArtifact {
    /// Checks internal alignment: one id, hash and vector per row, all
    /// vectors of the manifest's dimension, no repeated ids.
    pub fn validate(&self) -> AppResult<()> {
        let manifest = &self.manifest;
        if manifest.format_version != INDEX_FORMAT_VERSION {
            return Err(AppError::IndexUnavailable(format!(
                "Unsupported index format version {} (expected {})",
                manifest.format_version, INDEX_FORMAT_VERSION
            )));
        }

        if self.ids.len() != manifest.count
            || self.content_hashes.len() != manifest.count
            || self.vectors.len() != manifest.count
        {
            return Err(AppError::IndexUnavailable(format!(
                "Index rows misaligned: manifest count {}, ids {}, hashes {}, vectors {}",
                manifest.count,
                self.ids.len(),
                self.content_hashes.len(),
                self.vectors.len()
            )));
        }

        if let Some((row, vector)) = self
            .vectors
            .iter()
            .enumerate()
            .find(|(_, v)| v.len() != manifest.dimension)
        {
            return Err(AppError::IndexUnavailable(format!(
                "Index row {} has dimension {} (expected {})",
                row,
                vector.len(),
                manifest.dimension
            )));
        }

        let mut seen = HashSet::with_capacity(self.ids.len());
        if let Some(id) = self.ids.iter().find(|id| !seen.insert(**id)) {
            return Err(AppError::IndexUnavailable(format!(
                "Index contains id {} more than once",
                id
            )));
        }

        Ok(())
    }
}

pub fn write_index(path: &Path, artifact: &IndexArtifact) -> AppResult<()> {
    artifact.validate()?;
    write_json_atomic(path, artifact)?;
    tracing::info!(
        path = %path.display(),
        rows = artifact.manifest.count,
        dimension = artifact.manifest.dimension,
        embedding_model = %artifact.manifest.embedding_model,
        "Index written"
    );
    Ok(())
}

/// Reads and validates an index file. Missing or corrupt files are
/// `IndexUnavailable`: a deployment problem, not a request problem.
pub fn read_index(path: &Path) -> AppResult<IndexArtifact> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::IndexUnavailable(format!(
                "Index not found at {}; run `build_index embed` first",
                path.display()
            ))
        } else {
            AppError::Io(e)
        }
    })?;

    let artifact: IndexArtifact = serde_json::from_str(&content).map_err(|e| {
        AppError::IndexUnavailable(format!("Index at {} is corrupt: {}", path.display(), e))
    })?;
    artifact.validate()?;
    Ok(artifact)
}
