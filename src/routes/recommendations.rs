use axum::{extract::State, Json};

use crate::{
    error::AppResult,
    models::{RecommendationRequest, RecommendationResponse},
    routes::AppState,
};

/// Handler for recommendations endpoint
pub async fn recommend(
    State(state): State<AppState>,
    Json(request): Json<RecommendationRequest>,
) -> AppResult<Json<RecommendationResponse>> {
    let response = state
        .recommender
        .recommend(&request.query_text, request.k)
        .await?;
    Ok(Json(response))
}
