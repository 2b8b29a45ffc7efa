//! Catalog normalization
//!
//! Turns raw catalog exports (MovieLens `movies.csv`, TMDB dumps, hand-written
//! JSON) into the canonical record set: one record per id, no missing
//! composite text, consistent genre tags. Deterministic for identical input.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::{
    error::{AppError, AppResult},
    models::{Catalog, CatalogId, CatalogRecord},
};

/// Base URL for TMDB poster images
pub const TMDB_POSTER_BASE: &str = "https://image.tmdb.org/t/p/w342";

const ID_COLUMNS: &[&str] = &["id", "movieid", "movie_id", "tmdb_id"];
const TITLE_COLUMNS: &[&str] = &["title", "name"];
const SYNOPSIS_COLUMNS: &[&str] = &["overview", "synopsis", "description", "plot"];
const GENRE_COLUMNS: &[&str] = &["genres", "genre"];
const YEAR_COLUMNS: &[&str] = &["year", "release_year", "release_date"];
const POSTER_COLUMNS: &[&str] = &["poster_url", "poster", "poster_path", "images"];

const NO_GENRES: &str = "(no genres listed)";

/// A raw source row: column name → cell text. Empty cells are absent.
pub type RawRow = BTreeMap<String, String>;

/// Normalized catalog plus what was dropped on the way
#[derive(Debug, Clone)]
pub struct NormalizeReport {
    pub catalog: Catalog,
    pub total_rows: usize,
    pub dropped_invalid_id: usize,
    pub dropped_missing_text: usize,
    pub dropped_duplicates: usize,
}

/// Reads raw rows from CSV/TSV (header row) or JSON (array of objects, or
/// one object per line for `.jsonl`/`.ndjson`)
pub fn read_raw_rows(path: &Path) -> AppResult<Vec<RawRow>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let rows = match extension.as_str() {
        "csv" => read_delimited(path, b',')?,
        "tsv" => read_delimited(path, b'\t')?,
        "json" => {
            let content = std::fs::read_to_string(path)?;
            let values: Vec<Value> = serde_json::from_str(&content)?;
            values
                .into_iter()
                .map(row_from_json)
                .collect::<AppResult<Vec<_>>>()?
        }
        "jsonl" | "ndjson" => {
            let content = std::fs::read_to_string(path)?;
            content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str::<Value>(line).map_err(AppError::from))
                .map(|value| value.and_then(row_from_json))
                .collect::<AppResult<Vec<_>>>()?
        }
        other => {
            return Err(AppError::Catalog(format!(
                "Unsupported catalog format '{}' for {}",
                other,
                path.display()
            )))
        }
    };

    tracing::info!(path = %path.display(), rows = rows.len(), "Raw catalog read");
    Ok(rows)
}

fn read_delimited(path: &Path, delimiter: u8) -> AppResult<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn row_from_json(value: Value) -> AppResult<RawRow> {
    let Value::Object(map) = value else {
        return Err(AppError::Catalog(
            "Catalog JSON rows must be objects".to_string(),
        ));
    };

    let mut row = RawRow::new();
    for (key, value) in map {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            nested => nested.to_string(),
        };
        if !text.trim().is_empty() {
            row.insert(key.trim().to_lowercase(), text);
        }
    }
    Ok(row)
}

/// First non-empty cell among `aliases`, matching column names case-insensitively
fn field<'a>(row: &'a RawRow, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        row.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(alias))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    })
}

fn parse_id(raw: &str) -> Option<CatalogId> {
    if let Ok(id) = raw.parse::<u64>() {
        return Some(CatalogId(id));
    }
    // Spreadsheet exports write integer ids as `12.0`
    let float = raw.parse::<f64>().ok()?;
    if float >= 0.0 && float.fract() == 0.0 && float <= u64::MAX as f64 {
        Some(CatalogId(float as u64))
    } else {
        None
    }
}

/// Splits a MovieLens-style `Title (1995)` into title and year
fn split_title_year(raw: &str) -> (String, Option<i32>) {
    let trimmed = raw.trim();
    if let Some(open) = trimmed.rfind(" (") {
        let suffix = &trimmed[open + 2..];
        if suffix.len() == 5
            && suffix.ends_with(')')
            && suffix[..4].chars().all(|c| c.is_ascii_digit())
        {
            return (trimmed[..open].trim().to_string(), suffix[..4].parse().ok());
        }
    }
    (trimmed.to_string(), None)
}

fn parse_year(raw: &str) -> Option<i32> {
    raw.get(..4)
        .filter(|prefix| prefix.chars().all(|c| c.is_ascii_digit()))
        .and_then(|prefix| prefix.parse().ok())
}

/// Accepts `A|B`, `A, B`, `["A", "B"]` and TMDB's `[{"id": 1, "name": "A"}]`
pub fn parse_genres(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let tags: Vec<String> = if raw.starts_with('[') {
        match serde_json::from_str::<Vec<Value>>(raw) {
            Ok(values) => values
                .into_iter()
                .filter_map(|value| match value {
                    Value::String(s) => Some(s),
                    Value::Object(map) => map
                        .get("name")
                        .and_then(|name| name.as_str())
                        .map(str::to_string),
                    _ => None,
                })
                .collect(),
            Err(_) => split_tags(raw.trim_start_matches('[').trim_end_matches(']')),
        }
    } else {
        split_tags(raw)
    };

    let mut seen = HashSet::new();
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty() && !tag.eq_ignore_ascii_case(NO_GENRES))
        .map(title_case)
        .filter(|tag| seen.insert(tag.to_lowercase()))
        .collect()
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(['|', ','])
        .map(|tag| tag.trim().trim_matches(['\'', '"']).to_string())
        .collect()
}

fn title_case(tag: &str) -> String {
    tag.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn poster_url(row: &RawRow) -> Option<String> {
    for alias in POSTER_COLUMNS {
        let Some(value) = field(row, &[*alias]) else {
            continue;
        };
        let url = if *alias == "images" {
            poster_from_images(value)
        } else {
            poster_from_path(value)
        };
        if url.is_some() {
            return url;
        }
    }
    None
}

fn poster_from_path(value: &str) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Some(value.to_string())
    } else if value.starts_with('/') {
        Some(format!("{}{}", TMDB_POSTER_BASE, value))
    } else {
        None
    }
}

/// TMDB `images` blob: `{"posters": [{"full_url": ...} | {"file_path": ...}]}`
fn poster_from_images(value: &str) -> Option<String> {
    let images: Value = serde_json::from_str(value).ok()?;
    let poster = images.get("posters")?.as_array()?.first()?;
    poster
        .get("full_url")
        .and_then(|url| url.as_str())
        .and_then(poster_from_path)
        .or_else(|| {
            poster
                .get("file_path")
                .and_then(|path| path.as_str())
                .and_then(poster_from_path)
        })
}

fn synthesize_synopsis(title: &str, genres: &[String]) -> String {
    if genres.is_empty() {
        format!("A movie titled {}.", title)
    } else {
        format!("A {} movie titled {}.", genres.join(", "), title)
    }
}

/// Normalizes raw rows into the canonical catalog.
///
/// Rows without a usable id, or without both title and synopsis, are dropped;
/// a repeated id keeps its first occurrence.
pub fn normalize(rows: Vec<RawRow>) -> AppResult<NormalizeReport> {
    let total_rows = rows.len();
    let mut dropped_invalid_id = 0;
    let mut dropped_missing_text = 0;
    let mut dropped_duplicates = 0;

    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for row in &rows {
        let Some(id) = field(row, ID_COLUMNS).and_then(parse_id) else {
            dropped_invalid_id += 1;
            continue;
        };

        let (title, title_year) = field(row, TITLE_COLUMNS)
            .map(split_title_year)
            .unwrap_or_default();
        let synopsis = field(row, SYNOPSIS_COLUMNS).unwrap_or_default().to_string();

        if title.is_empty() && synopsis.is_empty() {
            dropped_missing_text += 1;
            continue;
        }

        if !seen.insert(id) {
            dropped_duplicates += 1;
            continue;
        }

        let genres = field(row, GENRE_COLUMNS)
            .map(parse_genres)
            .unwrap_or_default();
        let year = field(row, YEAR_COLUMNS).and_then(parse_year).or(title_year);
        let synopsis = if synopsis.is_empty() {
            synthesize_synopsis(&title, &genres)
        } else {
            synopsis
        };

        records.push(CatalogRecord::new(
            id,
            title,
            synopsis,
            genres,
            year,
            poster_url(row),
        ));
    }

    let catalog = Catalog::from_records(records).map_err(|id| {
        AppError::Internal(format!("Catalog id {} survived deduplication twice", id))
    })?;

    if dropped_duplicates > 0 {
        tracing::warn!(
            dropped_duplicates,
            "Duplicate catalog ids dropped (first occurrence kept)"
        );
    }

    tracing::info!(
        total_rows,
        kept = catalog.len(),
        dropped_invalid_id,
        dropped_missing_text,
        dropped_duplicates,
        "Catalog normalized"
    );

    Ok(NormalizeReport {
        catalog,
        total_rows,
        dropped_invalid_id,
        dropped_missing_text,
        dropped_duplicates,
    })
}
