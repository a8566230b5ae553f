use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health — live probes of every external collaborator.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let (embedder, vector, broker, database) = tokio::join!(
        state.services.embedder.health_check(),
        state.services.vector.health_check(),
        state.broker.health_check(),
        state.db.health_check(),
    );

    let all_up = embedder && vector && broker && database;
    Json(json!({
        "status": if all_up { "ok" } else { "degraded" },
        "services": {
            "embedder": embedder,
            "vector_index": vector,
            "job_broker": broker,
            "database": database,
        },
        "timestamp": Utc::now(),
    }))
}
