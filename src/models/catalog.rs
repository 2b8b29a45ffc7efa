use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, fmt::Display};

/// Version tag of the `composite_text` layout. Bump whenever
/// [`composite_text`] changes, so indexes built from the old layout are rejected.
pub const COMPOSITE_TEXT_VERSION: &str = "composite-v1";

/// Stable identifier of a catalog record (MovieLens `movieId` / TMDB id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(pub u64);

impl Display for CatalogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A canonical movie record. Immutable once built; `composite_text` is
/// always derived from the other fields and never read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredRecord", into = "StoredRecord")]
pub struct CatalogRecord {
    pub id: CatalogId,
    pub title: String,
    pub synopsis: String,
    pub genres: Vec<String>,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    composite_text: String,
}

/// On-disk row of the normalized catalog table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: CatalogId,
    title: String,
    #[serde(default)]
    synopsis: String,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    poster_url: Option<String>,
}

impl From<StoredRecord> for CatalogRecord {
    fn from(row: StoredRecord) -> Self {
        CatalogRecord::new(
            row.id,
            row.title,
            row.synopsis,
            row.genres,
            row.year,
            row.poster_url,
        )
    }
}

impl From<CatalogRecord> for StoredRecord {
    fn from(record: CatalogRecord) -> Self {
        StoredRecord {
            id: record.id,
            title: record.title,
            synopsis: record.synopsis,
            genres: record.genres,
            year: record.year,
            poster_url: record.poster_url,
        }
    }
}

impl CatalogRecord {
    pub fn new(
        id: CatalogId,
        title: String,
        synopsis: String,
        genres: Vec<String>,
        year: Option<i32>,
        poster_url: Option<String>,
    ) -> Self {
        let composite_text = composite_text(&title, &synopsis, &genres);
        Self {
            id,
            title,
            synopsis,
            genres,
            year,
            poster_url,
            composite_text,
        }
    }

    /// Text submitted to the embedding model for this record
    pub fn composite_text(&self) -> &str {
        &self.composite_text
    }

    /// SHA-256 of the composite text, hex encoded. Used to decide whether a
    /// stored vector is still valid for this record.
    pub fn content_hash(&self) -> String {
        hex_digest(self.composite_text.as_bytes())
    }
}

/// Title, synopsis, genres; empty parts are skipped
pub fn composite_text(title: &str, synopsis: &str, genres: &[String]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if !title.is_empty() {
        parts.push(title.to_string());
    }
    if !synopsis.is_empty() {
        parts.push(synopsis.to_string());
    }
    if !genres.is_empty() {
        parts.push(format!("Genres: {}", genres.join(", ")));
    }
    parts.join("\n")
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The normalized catalog, in source order, with an id lookup
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Vec<CatalogRecord>,
    by_id: HashMap<CatalogId, usize>,
}

impl Catalog {
    /// Builds a catalog from records that already have unique ids
    pub fn from_records(records: Vec<CatalogRecord>) -> Result<Self, CatalogId> {
        let mut by_id = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if by_id.insert(record.id, position).is_some() {
                return Err(record.id);
            }
        }
        Ok(Self { records, by_id })
    }

    pub fn get(&self, id: CatalogId) -> Option<&CatalogRecord> {
        self.by_id.get(&id).map(|&position| &self.records[position])
    }

    pub fn records(&self) -> &[CatalogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// SHA-256 over `(id, composite_text)` pairs sorted by id.
    ///
    /// Identifies the exact catalog content an index was built from,
    /// independent of row order in the table.
    pub fn fingerprint(&self) -> String {
        let mut ordered: Vec<&CatalogRecord> = self.records.iter().collect();
        ordered.sort_by_key(|record| record.id);

        let mut hasher = Sha256::new();
        for record in ordered {
            hasher.update(record.id.0.to_le_bytes());
            hasher.update(record.composite_text.as_bytes());
            hasher.update([0u8]);
        }
        to_hex(&hasher.finalize())
    }
}
