//! Error to HTTP mapping.
//!
//! Core errors become a canonical JSON envelope; the status code comes
//! from the error kind. Pipeline terminals that are not transport errors
//! (a ticket that *finished* with `status = "error"`) are mapped by the
//! route handlers instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use parleql_core::ParleQLError;

/// Wrapper giving core errors an axum `IntoResponse`.
pub struct ApiError(pub ParleQLError);

impl From<ParleQLError> for ApiError {
    fn from(error: ParleQLError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "status": "error",
            "error": self.0.error_code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Status code for a terminal error kind carried on a finished ticket.
#[must_use]
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation_empty" | "validation_too_long" | "validation_sql_rejected"
        | "injection_blocked" | "invalid_identifiers" | "dialect_conversion_failed"
        | "cost_blocked" | "clarification_needed" => StatusCode::BAD_REQUEST,
        "unauthorized" | "approval_forbidden" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "approval_duplicate" => StatusCode::CONFLICT,
        "quota_exceeded" => StatusCode::TOO_MANY_REQUESTS,
        "breaker_open" => StatusCode::SERVICE_UNAVAILABLE,
        "execution_timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_spec_status_codes() {
        assert_eq!(status_for_kind("injection_blocked"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("approval_duplicate"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("quota_exceeded"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for_kind("breaker_open"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_kind("execution_timeout"), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for_kind("llm_empty"), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
