pub mod catalog;
pub mod recommendation;

pub use catalog::{Catalog, CatalogId, CatalogRecord, COMPOSITE_TEXT_VERSION};
pub use recommendation::{
    Candidate, Composition, CompositionOutcome, DegradeReason, Recommendation,
    RecommendationItem, RecommendationRequest, RecommendationResponse,
};
