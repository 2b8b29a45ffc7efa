use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::Config,
    error::AppResult,
    middleware::{make_span_with_request_id, request_id_middleware},
    services::{
        index_build::IndexPaths,
        index_store::{load_snapshot, IndexExpectation, IndexStore},
        providers::{create_embedding_model, create_generation_model},
        recommendations::RecommendationService,
    },
};

pub mod index;
pub mod recommendations;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<IndexStore>,
    pub recommender: Arc<RecommendationService>,
    pub paths: IndexPaths,
    pub expectation: IndexExpectation,
}

impl AppState {
    /// Builds the models from configuration and loads the index.
    ///
    /// A missing or mismatched index is logged and the server still starts;
    /// recommendation requests then fail with 503 until a reload succeeds.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let store = Arc::new(IndexStore::empty());
        let embedder = create_embedding_model(config)?;
        let generator = create_generation_model(config)?;
        let expectation = IndexExpectation::for_model(embedder.model_id());
        let recommender =
            RecommendationService::with_models(config, Arc::clone(&store), embedder, generator);

        let state = Self {
            store,
            recommender: Arc::new(recommender),
            paths: IndexPaths::from_config(config),
            expectation,
        };

        match load_snapshot(&state.paths.catalog, &state.paths.index, &state.expectation) {
            Ok(snapshot) => state.store.publish(snapshot),
            Err(e) => tracing::error!(
                error = %e,
                index_path = %state.paths.index.display(),
                "Index failed to load; recommendations are unavailable until a successful reload"
            ),
        }

        Ok(state)
    }
}

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/recommendations", post(recommendations::recommend))
        .route("/index/reload", post(index::reload))
}

/// Health check endpoint; reports whether an index is being served
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let index = match state.store.current() {
        Some(snapshot) => json!({
            "loaded": true,
            "records": snapshot.index.len(),
            "embedding_model": snapshot.manifest.embedding_model,
            "built_at": snapshot.manifest.built_at,
        }),
        None => json!({ "loaded": false }),
    };

    (StatusCode::OK, Json(json!({ "status": "healthy", "index": index })))
}
