use serde::{Deserialize, Serialize};

use super::catalog::{CatalogId, CatalogRecord};

/// A retrieved record with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub record: CatalogRecord,
    pub score: f32,
}

/// A record picked for the user, with the model's reason when there is one
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub record: CatalogRecord,
    pub rationale: Option<String>,
}

impl From<Candidate> for Recommendation {
    fn from(candidate: Candidate) -> Self {
        Self {
            record: candidate.record,
            rationale: None,
        }
    }
}

/// Why a composition fell back to raw retrieval order
#[derive(Debug, Clone, PartialEq)]
pub enum DegradeReason {
    /// The generation model failed with a transient error (timeout, rate limit, 5xx)
    GenerationUnavailable(String),
    /// The model answered twice without a usable selection
    UnparseableResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositionOutcome {
    Ranked,
    Degraded(DegradeReason),
}

/// Result of composing recommendations for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub recommendations: Vec<Recommendation>,
    pub outcome: CompositionOutcome,
}

impl Composition {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, CompositionOutcome::Degraded(_))
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Inbound recommendation request
#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationRequest {
    pub query_text: String,
    /// Defaults to the configured result count when omitted
    #[serde(default)]
    pub k: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationItem {
    pub id: CatalogId,
    pub title: String,
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
}

impl From<Recommendation> for RecommendationItem {
    fn from(recommendation: Recommendation) -> Self {
        Self {
            id: recommendation.record.id,
            title: recommendation.record.title,
            rationale: recommendation.rationale,
            poster: recommendation.record.poster_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationResponse {
    pub recommendations: Vec<RecommendationItem>,
    /// True when the list is raw retrieval order without rationales
    pub degraded: bool,
}

impl From<Composition> for RecommendationResponse {
    fn from(composition: Composition) -> Self {
        let degraded = composition.is_degraded();
        Self {
            recommendations: composition
                .recommendations
                .into_iter()
                .map(RecommendationItem::from)
                .collect(),
            degraded,
        }
    }
}
