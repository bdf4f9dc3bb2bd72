//! SSE streaming of ticket lifecycle events.
//!
//! `GET /queries/{id}/stream` replays the ticket's history and then
//! follows it live. The stream ends after the terminal frame; a client
//! that disconnects earlier cancels the ticket (wired through the event
//! bus subscription's drop guard).

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use serde::Deserialize;

use parleql_core::types::validate_query_id;
use parleql_core::ParleQLError;

use crate::error::ApiError;
use crate::extractors::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Token-authenticated access for EventSource clients that cannot
    /// set headers. Validated by the auth middleware upstream; its
    /// presence here only bypasses the header identity requirement in
    /// dev mode.
    #[serde(default)]
    #[allow(dead_code)]
    pub token: Option<String>,
}

/// `GET /queries/{id}/stream`.
pub async fn stream(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Query(_query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    validate_query_id(&id)?;

    let metadata = state
        .core
        .events
        .get_metadata(&id)
        .ok_or_else(|| ApiError(ParleQLError::not_found("query", &id)))?;
    if !auth.may_access(&metadata.owner_user) && !state.core.config.dev_mode {
        return Err(ApiError(ParleQLError::unauthorized("not the ticket owner")));
    }

    let subscription = state
        .core
        .events
        .subscribe(&id)
        .ok_or_else(|| ApiError(ParleQLError::not_found("query", &id)))?;

    let events = event_stream(subscription);
    let sse = Sse::new(events).keep_alive(KeepAlive::default());
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().expect("static header"));
    headers.insert(header::CONNECTION, "keep-alive".parse().expect("static header"));
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    Ok(response)
}

fn event_stream(
    subscription: parleql_core::events::Subscription,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let record = subscription.next().await?;
        let event = Event::default()
            .event(record.state.as_str())
            .data(
                serde_json::to_string(&serde_json::json!({
                    "ticket_id": record.ticket_id,
                    "state": record.state,
                    "timestamp": record.timestamp.to_rfc3339(),
                    "payload": record.payload,
                }))
                .unwrap_or_else(|_| "{}".to_string()),
            );
        Some((Ok(event), subscription))
    })
}
