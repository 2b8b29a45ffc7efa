use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    routes::AppState,
    services::index_store::load_snapshot,
};

/// Reloads the catalog table and index file from disk and publishes them.
/// On failure the current snapshot stays in service.
pub async fn reload(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let paths = state.paths.clone();
    let expectation = state.expectation.clone();

    let snapshot = tokio::task::spawn_blocking(move || {
        load_snapshot(&paths.catalog, &paths.index, &expectation)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Index reload task failed: {}", e)))?
    .map_err(|e| {
        tracing::error!(error = %e, "Index reload failed; keeping the current index");
        e
    })?;

    let records = snapshot.index.len();
    let embedding_model = snapshot.manifest.embedding_model.clone();
    state.store.publish(snapshot);

    Ok(Json(json!({
        "status": "reloaded",
        "records": records,
        "embedding_model": embedding_model,
    })))
}
