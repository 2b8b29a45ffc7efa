use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::{error::AppResult, models::CatalogId};

/// One embedded record, appended as a JSON line after each finished batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    pub embedding_model: String,
    pub id: CatalogId,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

/// Append-only writer for the build checkpoint
pub struct CheckpointWriter {
    file: File,
}

impl CheckpointWriter {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends entries and flushes, so a crash after this returns loses nothing
    pub fn append(&mut self, entries: &[CheckpointEntry]) -> AppResult<()> {
        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        self.file.write_all(&buffer)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Reads every intact entry of a checkpoint. A missing file is an empty
/// checkpoint; a torn trailing line (interrupted write) is skipped.
pub fn read_checkpoint(path: &Path) -> AppResult<Vec<CheckpointEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(
            path = %path.display(),
            skipped,
            "Skipped unreadable checkpoint lines"
        );
    }

    Ok(entries)
}

pub fn remove_checkpoint(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
