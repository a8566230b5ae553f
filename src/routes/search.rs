//! Search and stats endpoints.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::MAX_SEARCH_QUERY_LENGTH;
use crate::error::{AppError, AppResult};
use crate::search::{run_search, SearchMode};
use crate::state::AppState;
use crate::vector::SearchFilter;

const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: Option<SearchFilter>,
}

/// POST /api/search
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if request.query.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "search query must not be empty".to_string(),
        ));
    }
    if request.query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "search query too long ({} chars, max {})",
            request.query.len(),
            MAX_SEARCH_QUERY_LENGTH
        )));
    }
    let limit = request.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    if limit == 0 || limit > MAX_SEARCH_LIMIT {
        return Err(AppError::Unprocessable(format!(
            "limit must be between 1 and {}",
            MAX_SEARCH_LIMIT
        )));
    }
    let filter = request.filters.unwrap_or_default();

    let results = run_search(&state.services, &request.query, request.mode, limit, &filter).await;
    let total = results.len();

    Ok(Json(json!({
        "results": results,
        "total": total,
        "query": request.query,
        "mode": request.mode,
    })))
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let qdrant_points = match state.services.vector.count().await {
        Ok(count) => count,
        Err(e) => {
            warn!("vector count unavailable: {}", e);
            0
        }
    };

    let bm25 = state.services.bm25.clone();
    let bm25_documents = tokio::task::spawn_blocking(move || bm25.count())
        .await
        .unwrap_or(0);

    Ok(Json(json!({
        "total_documents": bm25_documents,
        "total_chunks": qdrant_points,
        "qdrant_points": qdrant_points,
        "bm25_documents": bm25_documents,
        "collection_name": state.config.qdrant_collection,
    })))
}
