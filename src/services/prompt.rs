//! Bounded prompt construction for the recommendation composer

use serde::Serialize;

use crate::{
    error::AppResult,
    models::{Candidate, CatalogId},
    services::providers::Prompt,
};

const SYSTEM_INSTRUCTIONS: &str = "You are VibeWatch, a movie recommendation assistant. \
Based on the user's current context (mood, social setting, location, attention level, etc.), \
choose 3 to 5 movies from the given candidate list. \
Explain briefly (1 or 2 sentences) why each one fits the context. \
Only choose movies that appear in the candidate list; never invent titles.";

const STRICT_INSTRUCTIONS: &str = "Your previous answer could not be read. \
Reply with ONLY a JSON array and nothing else: no prose, no Markdown, no code fences. \
Copy each id and title exactly as it appears in the candidate list.";

const RESPONSE_FORMAT: &str = "Return JSON:\n[\n  {\"id\": 123, \"title\": \"...\", \"reason\": \"...\"},\n  ...\n]";

/// One candidate as shown to the model
#[derive(Serialize)]
struct CandidateLine<'a> {
    id: CatalogId,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    year: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    genres: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    synopsis: String,
}

/// A prompt plus how many of the leading candidates made it in
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub prompt: Prompt,
    pub included: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptBuilder {
    pub max_chars: usize,
    pub synopsis_excerpt_chars: usize,
    pub query_max_chars: usize,
}

impl PromptBuilder {
    /// Builds a prompt no longer than `max_chars`. Candidates are added in
    /// retrieval order until the next one would exceed the cap.
    pub fn build(&self, query: &str, candidates: &[Candidate], strict: bool) -> AppResult<BuiltPrompt> {
        let system = if strict {
            format!("{}\n\n{}", SYSTEM_INSTRUCTIONS, STRICT_INSTRUCTIONS)
        } else {
            SYSTEM_INSTRUCTIONS.to_string()
        };

        let query = truncate_chars(query.trim(), self.query_max_chars);
        let header = format!(
            "USER CONTEXT (free text):\n{}\n\nCANDIDATE MOVIES (JSON Lines, one movie per line):\n",
            query
        );
        let footer = format!("\n\n{}", RESPONSE_FORMAT);

        let fixed = system.chars().count() + header.chars().count() + footer.chars().count();
        let budget = self.max_chars.saturating_sub(fixed);

        let mut lines = Vec::new();
        let mut used = 0usize;
        for candidate in candidates {
            let line = self.candidate_line(candidate)?;
            let cost = line.chars().count() + usize::from(!lines.is_empty());
            if used + cost > budget {
                break;
            }
            used += cost;
            lines.push(line);
        }

        if lines.len() < candidates.len() {
            tracing::debug!(
                included = lines.len(),
                candidates = candidates.len(),
                max_chars = self.max_chars,
                "Prompt cap reached, remaining candidates left out"
            );
        }

        let included = lines.len();
        let user = format!("{}{}{}", header, lines.join("\n"), footer);

        Ok(BuiltPrompt {
            prompt: Prompt { system, user },
            included,
        })
    }

    fn candidate_line(&self, candidate: &Candidate) -> AppResult<String> {
        let record = &candidate.record;
        let line = CandidateLine {
            id: record.id,
            title: &record.title,
            year: record.year,
            genres: record.genres.join(", "),
            synopsis: excerpt(&record.synopsis, self.synopsis_excerpt_chars),
        };
        Ok(serde_json::to_string(&line)?)
    }
}

/// At most `max_chars` characters of `text`, cut on a word boundary when
/// one exists, ending in `…` when anything was removed
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let head = truncate_chars(text, max_chars - 1);
    let cut = match head.rfind(char::is_whitespace) {
        Some(boundary) if boundary > 0 => &head[..boundary],
        _ => head,
    };
    format!("{}…", cut.trim_end())
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
