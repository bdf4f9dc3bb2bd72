//! Connection listing.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// `GET /connections`: backends the executor knows about.
pub async fn connections(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut backends: Vec<String> = state
        .core
        .executor
        .registered_backends()
        .into_iter()
        .map(|k| k.as_str().to_string())
        .collect();
    backends.sort();
    Json(json!({
        "status": "success",
        "connections": backends,
    }))
}
