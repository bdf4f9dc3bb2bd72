//! Route assembly.

pub mod connections;
pub mod health;
pub mod queries;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/connections", get(connections::connections))
        .route("/queries/submit", post(queries::submit))
        .route("/queries/process", post(queries::process))
        .route("/queries/history", get(queries::history))
        .route("/queries/clarify", post(queries::clarify))
        .route("/queries/{id}/approve", post(queries::approve))
        .route("/queries/{id}/reject", post(queries::reject))
        .route("/queries/{id}/cancel", post(queries::cancel))
        .route("/queries/{id}/status", get(queries::status))
        .route("/queries/{id}/stream", get(stream::stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
