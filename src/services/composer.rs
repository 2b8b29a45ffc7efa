//! Recommendation composition
//!
//! Asks the generation model to pick and explain a few of the retrieved
//! candidates. The model's answer is only trusted after it has been parsed
//! and every pick resolved back to a candidate; anything else falls back to
//! the retrieval order, so a request with candidates never comes back empty.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    error::{AppError, AppResult, FailureKind},
    models::{Candidate, CatalogId, Composition, CompositionOutcome, DegradeReason, Recommendation},
    services::{
        prompt::PromptBuilder,
        providers::{GenerationModel, Prompt},
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposerSettings {
    /// Limit on all generation calls made for one request
    pub timeout: Duration,
    pub prompt_max_chars: usize,
    pub synopsis_excerpt_chars: usize,
    pub query_max_chars: usize,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            prompt_max_chars: 12_000,
            synopsis_excerpt_chars: 280,
            query_max_chars: 1_000,
        }
    }
}

/// One pick as the model wrote it, before resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub id: Option<CatalogId>,
    pub title: Option<String>,
    pub reason: Option<String>,
}

/// Outcome of parsing a model response
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedSelection {
    Parsed(Vec<Selection>),
    /// Nothing usable; carries the raw text for logging
    Failed(String),
}

/// Extracts selections from a model response.
///
/// Accepts a JSON array of objects, bare, inside Markdown code fences,
/// surrounded by prose, or under a `recommendations` key.
pub fn parse_selection(raw: &str) -> ParsedSelection {
    let text = strip_code_fences(raw.trim());

    let value = serde_json::from_str::<Value>(text)
        .ok()
        .or_else(|| slice_between(text, '[', ']').and_then(|s| serde_json::from_str(s).ok()))
        .or_else(|| slice_between(text, '{', '}').and_then(|s| serde_json::from_str(s).ok()));

    let items = match value {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut map)) => match map.remove("recommendations") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let selections: Vec<Selection> = items.iter().filter_map(selection_from_value).collect();
    if selections.is_empty() {
        ParsedSelection::Failed(raw.to_string())
    } else {
        ParsedSelection::Parsed(selections)
    }
}

fn strip_code_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip the language tag line
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    let end = body.find("```").unwrap_or(body.len());
    body[..end].trim()
}

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn selection_from_value(value: &Value) -> Option<Selection> {
    let object = value.as_object()?;

    let id = object.get("id").and_then(|id| match id {
        Value::Number(n) => n.as_u64().map(CatalogId),
        Value::String(s) => s.trim().parse().ok().map(CatalogId),
        _ => None,
    });
    let title = text_field(object, &["title", "name"]);
    let reason = text_field(object, &["reason", "rationale", "explanation"]);

    (id.is_some() || title.is_some()).then_some(Selection { id, title, reason })
}

fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Maps selections onto candidates by id, then exact title, then
/// case-insensitive title containment. Unmatched and repeated picks are dropped.
pub fn resolve_selections(selections: &[Selection], candidates: &[Candidate]) -> Vec<Recommendation> {
    let mut used = HashSet::new();
    let mut resolved = Vec::new();
    let mut unmatched = 0usize;

    for selection in selections {
        let Some(candidate) = find_candidate(selection, candidates) else {
            unmatched += 1;
            continue;
        };
        if !used.insert(candidate.record.id) {
            continue;
        }
        resolved.push(Recommendation {
            record: candidate.record.clone(),
            rationale: selection.reason.clone(),
        });
    }

    if unmatched > 0 {
        tracing::warn!(unmatched, "Dropped selections that match no candidate");
    }
    resolved
}

fn find_candidate<'a>(selection: &Selection, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    if let Some(candidate) = selection
        .id
        .and_then(|id| candidates.iter().find(|c| c.record.id == id))
    {
        return Some(candidate);
    }

    let title = selection.title.as_deref()?;
    if let Some(candidate) = candidates.iter().find(|c| c.record.title == title) {
        return Some(candidate);
    }

    let wanted = title.to_lowercase();
    candidates.iter().find(|c| {
        let known = c.record.title.to_lowercase();
        !known.is_empty() && (known.contains(&wanted) || wanted.contains(&known))
    })
}

pub struct Composer {
    model: Arc<dyn GenerationModel>,
    settings: ComposerSettings,
    prompts: PromptBuilder,
}

impl Composer {
    pub fn new(model: Arc<dyn GenerationModel>, settings: ComposerSettings) -> Self {
        let prompts = PromptBuilder {
            max_chars: settings.prompt_max_chars,
            synopsis_excerpt_chars: settings.synopsis_excerpt_chars,
            query_max_chars: settings.query_max_chars,
        };
        Self {
            model,
            settings,
            prompts,
        }
    }

    /// Picks and explains recommendations among `candidates`.
    ///
    /// Transient generation failures and unusable answers degrade to the
    /// candidates in retrieval order; fatal generation failures are errors.
    pub async fn compose(&self, query_text: &str, candidates: Vec<Candidate>) -> AppResult<Composition> {
        if candidates.is_empty() {
            return Ok(Composition {
                recommendations: Vec::new(),
                outcome: CompositionOutcome::Ranked,
            });
        }

        // One budget covers the first attempt and the strict retry
        let deadline = Instant::now() + self.settings.timeout;

        for strict in [false, true] {
            let built = self.prompts.build(query_text, &candidates, strict)?;
            if built.included == 0 {
                tracing::warn!(
                    prompt_max_chars = self.settings.prompt_max_chars,
                    "No candidate fits within the prompt cap"
                );
                return Ok(degrade(
                    candidates,
                    DegradeReason::GenerationUnavailable("prompt cap too small for any candidate".to_string()),
                ));
            }

            let raw = match self.generate(&built.prompt, deadline).await {
                Ok(raw) => raw,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Generation unavailable, returning retrieval order");
                    return Ok(degrade(candidates, DegradeReason::GenerationUnavailable(e.to_string())));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Generation failed");
                    return Err(e);
                }
            };

            match resolve_answer(&raw, &candidates) {
                Ok(recommendations) => {
                    tracing::info!(
                        selected = recommendations.len(),
                        candidates = candidates.len(),
                        strict,
                        "Recommendations composed"
                    );
                    return Ok(Composition {
                        recommendations,
                        outcome: CompositionOutcome::Ranked,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, strict, "Unusable model response");
                    tracing::debug!(raw = %raw, "Raw model response");
                }
            }
        }

        Ok(degrade(candidates, DegradeReason::UnparseableResponse))
    }

    async fn generate(&self, prompt: &Prompt, deadline: Instant) -> AppResult<String> {
        match tokio::time::timeout_at(deadline, self.model.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::generation(
                FailureKind::Transient,
                format!("Generation timed out after {:?}", self.settings.timeout),
            )),
        }
    }
}

/// Parses a model answer and resolves it against `candidates`.
/// An answer with no usable pick is a `Parse` error.
fn resolve_answer(raw: &str, candidates: &[Candidate]) -> AppResult<Vec<Recommendation>> {
    match parse_selection(raw) {
        ParsedSelection::Parsed(selections) => {
            let recommendations = resolve_selections(&selections, candidates);
            if recommendations.is_empty() {
                Err(AppError::Parse("no selection matched a candidate".to_string()))
            } else {
                Ok(recommendations)
            }
        }
        ParsedSelection::Failed(_) => Err(AppError::Parse(
            "response is not a list of selections".to_string(),
        )),
    }
}

fn degrade(candidates: Vec<Candidate>, reason: DegradeReason) -> Composition {
    Composition {
        recommendations: candidates.into_iter().map(Recommendation::from).collect(),
        outcome: CompositionOutcome::Degraded(reason),
    }
}
