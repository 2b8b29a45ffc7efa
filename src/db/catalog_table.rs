use std::path::Path;

use crate::{
    db::write_json_atomic,
    error::{AppError, AppResult},
    models::{Catalog, CatalogRecord},
};

/// Writes the normalized catalog as a JSON array of records
pub fn write_catalog(path: &Path, catalog: &Catalog) -> AppResult<()> {
    write_json_atomic(path, &catalog.records())?;
    tracing::info!(
        path = %path.display(),
        records = catalog.len(),
        "Normalized catalog written"
    );
    Ok(())
}

/// Reads the normalized catalog table written by [`write_catalog`]
pub fn read_catalog(path: &Path) -> AppResult<Catalog> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::IndexUnavailable(format!(
                "Catalog table not found at {}; run `build_index normalize` first",
                path.display()
            ))
        } else {
            AppError::Io(e)
        }
    })?;

    let records: Vec<CatalogRecord> = serde_json::from_str(&content).map_err(|e| {
        AppError::IndexUnavailable(format!(
            "Catalog table at {} is corrupt: {}",
            path.display(),
            e
        ))
    })?;

    Catalog::from_records(records).map_err(|id| {
        AppError::IndexUnavailable(format!(
            "Catalog table at {} has duplicate id {}",
            path.display(),
            id
        ))
    })
}
