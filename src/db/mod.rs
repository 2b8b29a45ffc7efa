//! On-disk artifacts: the normalized catalog table, the index file and the
//! build checkpoint.

pub mod catalog_table;
pub mod checkpoint;
pub mod index_file;

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{AppError, AppResult};

pub use catalog_table::{read_catalog, write_catalog};
pub use checkpoint::{read_checkpoint, remove_checkpoint, CheckpointEntry, CheckpointWriter};
pub use index_file::{read_index, write_index, IndexArtifact, IndexManifest, INDEX_FORMAT_VERSION};

/// Serializes `value` to a temp file next to `path`, then renames it over `path`.
///
/// Readers see either the previous file or the complete new one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}
