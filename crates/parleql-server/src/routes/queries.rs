//! Query lifecycle endpoints: submit, process, approve, reject, cancel,
//! clarify, status, history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use parleql_core::orchestrator::{ApprovalDecision, Disposition, QueryTicket, SubmitParams};
use parleql_core::types::validate_query_id;
use parleql_core::{DatabaseKind, ParleQLError};

use crate::error::{status_for_kind, ApiError};
use crate::extractors::AuthContext;
use crate::state::AppState;

// ============================================================================
// Bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    query: String,
    #[serde(default)]
    #[allow(dead_code)]
    connection_name: Option<String>,
    database_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ProcessBody {
    query: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    database_type: Option<String>,
    #[serde(default)]
    auto_approve: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    approved: bool,
    #[serde(default)]
    modified_sql: Option<String>,
    #[serde(default)]
    rejection_reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    decision_reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    constraints_applied: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct ClarifyBody {
    query_id: String,
    clarification: String,
    #[serde(default)]
    original_query: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    database_type: Option<String>,
}

fn parse_database(name: &str) -> Result<DatabaseKind, ApiError> {
    DatabaseKind::parse(name).ok_or_else(|| {
        ApiError(ParleQLError::sql_rejected(format!(
            "unknown database_type '{name}'"
        )))
    })
}

// ============================================================================
// Envelopes
// ============================================================================

fn status_name(ticket: &QueryTicket) -> &'static str {
    match ticket.disposition {
        Some(Disposition::Success | Disposition::Reply) => "success",
        Some(Disposition::ClarificationNeeded) => "clarification_needed",
        Some(Disposition::Rejected) => "rejected",
        Some(Disposition::Cancelled) => "cancelled",
        Some(Disposition::Error) => "error",
        Some(Disposition::PendingApproval) | None => "pending_approval",
    }
}

/// The `/process`-shaped envelope, shared by process, approve, and
/// clarify.
fn process_envelope(ticket: &QueryTicket) -> JsonValue {
    let needs_approval = ticket.disposition.is_none();
    let mut envelope = json!({
        "query_id": ticket.id,
        "status": status_name(ticket),
        "needs_approval": needs_approval,
        "timestamp": Utc::now().to_rfc3339(),
    });
    let object = envelope.as_object_mut().expect("envelope is an object");

    if let Some(sql) = ticket.effective_sql() {
        object.insert("sql_query".to_string(), json!(sql));
    }
    if let Some(generated) = &ticket.sql {
        object.insert("sql_confidence".to_string(), json!(generated.confidence));
    }
    if let Some(verdict) = &ticket.verdict {
        object.insert(
            "validation".to_string(),
            json!({
                "valid": verdict.valid,
                "risk_level": verdict.risk_level,
                "query_kind": verdict.query_kind,
                "warnings": verdict.warnings,
                "risk_reasons": verdict.risk_reasons,
                "scope_info": verdict.scope_info,
                "rls_applied": verdict.rls_applied,
            }),
        );
        if let Some(estimate) = &verdict.cost_estimate {
            if !estimate.recommendations.is_empty() {
                object.insert(
                    "optimization_suggestions".to_string(),
                    json!(estimate.recommendations),
                );
            }
        }
    }
    if let Some(result) = &ticket.result {
        object.insert("results".to_string(), json!(result));
    }
    if let Some(visualization) = &ticket.visualization {
        object.insert("visualization".to_string(), json!(visualization));
    }
    if let Some(reply) = &ticket.reply {
        object.insert("message".to_string(), json!(reply));
    }
    object.insert("llm_metadata".to_string(), json!(ticket.llm_metadata));
    object.insert("cost_optimized".to_string(), json!(ticket.cost_optimized));
    if let Some(error) = &ticket.error {
        object.insert("error".to_string(), json!(error));
    }
    if let Some(clarification) = &ticket.clarification {
        object.insert(
            "clarification_message".to_string(),
            json!(clarification.message),
        );
        object.insert("clarification_details".to_string(), json!(clarification));
    }
    envelope
}

fn process_response(ticket: &QueryTicket) -> Response {
    let status = match (&ticket.disposition, &ticket.error_kind) {
        (Some(Disposition::Error), Some(kind)) => status_for_kind(kind),
        _ => StatusCode::OK,
    };
    (status, Json(process_envelope(ticket))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /queries/submit`, the one-shot form: run and return rows.
pub async fn submit(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let database = parse_database(&body.database_type)?;
    let outcome = state
        .core
        .orchestrator()
        .submit(SubmitParams {
            user: auth.user,
            role: auth.role,
            session_id: auth.session_id,
            ip: auth.ip,
            user_agent: auth.user_agent,
            database,
            auto_approve: Some(true),
            text: body.query,
            history: Vec::new(),
        })
        .await?;

    let ticket = outcome.ticket;
    let status = match (&ticket.disposition, &ticket.error_kind) {
        (Some(Disposition::Error), Some(kind)) => status_for_kind(kind),
        _ => StatusCode::OK,
    };
    let message = ticket
        .reply
        .clone()
        .or_else(|| ticket.error.clone())
        .or_else(|| ticket.clarification.as_ref().map(|c| c.message.clone()))
        .unwrap_or_else(|| "ok".to_string());
    let envelope = json!({
        "query_id": ticket.id,
        "status": status_name(&ticket),
        "message": message,
        "sql": ticket.effective_sql(),
        "results": ticket.result,
        "execution_time_ms": ticket.result.as_ref().map(|r| r.execution_time_ms),
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok((status, Json(envelope)).into_response())
}

/// `POST /queries/process`, returning the full pipeline envelope.
pub async fn process(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<ProcessBody>,
) -> Result<Response, ApiError> {
    let database = match &body.database_type {
        Some(name) => parse_database(name)?,
        None => DatabaseKind::Postgres,
    };
    let outcome = state
        .core
        .orchestrator()
        .submit(SubmitParams {
            user: body.user_id.unwrap_or(auth.user),
            role: auth.role,
            session_id: body.session_id.unwrap_or(auth.session_id),
            ip: auth.ip,
            user_agent: auth.user_agent,
            database,
            auto_approve: body.auto_approve,
            text: body.query,
            history: Vec::new(),
        })
        .await?;
    Ok(process_response(&outcome.ticket))
}

/// `POST /queries/{id}/approve`.
pub async fn approve(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Response, ApiError> {
    validate_query_id(&id)?;
    authorize_ticket(&state, &auth, &id)?;
    let outcome = state
        .core
        .orchestrator()
        .approve(
            &id,
            ApprovalDecision {
                approved: body.approved,
                modified_sql: body.modified_sql,
                rejection_reason: body.rejection_reason,
            },
        )
        .await?;
    Ok(process_response(&outcome.ticket))
}

/// `POST /queries/{id}/reject`.
pub async fn reject(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    validate_query_id(&id)?;
    authorize_ticket(&state, &auth, &id)?;
    state
        .core
        .orchestrator()
        .approve(
            &id,
            ApprovalDecision {
                approved: false,
                modified_sql: None,
                rejection_reason: None,
            },
        )
        .await?;
    Ok(Json(json!({
        "query_id": id,
        "status": "rejected",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response())
}

/// `POST /queries/{id}/cancel`. The body's `query_id` duplicates the
/// path parameter and is ignored.
pub async fn cancel(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    validate_query_id(&id)?;
    authorize_ticket(&state, &auth, &id)?;
    let cancelled = state.core.orchestrator().cancel(&id).await?;
    Ok(Json(json!({
        "query_id": id,
        "status": if cancelled { "cancelled" } else { "not_found" },
        "cancelled": cancelled,
    }))
    .into_response())
}

/// `POST /queries/clarify`: resume a clarified question on the same
/// thread.
pub async fn clarify(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<ClarifyBody>,
) -> Result<Response, ApiError> {
    validate_query_id(&body.query_id)?;
    authorize_ticket(&state, &auth, &body.query_id)?;
    let outcome = state
        .core
        .orchestrator()
        .clarify(
            &body.query_id,
            &body.clarification,
            body.original_query.as_deref(),
        )
        .await?;
    Ok(process_response(&outcome.ticket))
}

/// `GET /queries/{id}/status`.
pub async fn status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    validate_query_id(&id)?;
    let ticket = state.core.orchestrator().load(&id).await?;
    if !auth.may_access(&ticket.owner_user) {
        return Err(ApiError(ParleQLError::unauthorized(
            "not the ticket owner",
        )));
    }
    let mut envelope = json!({
        "query_id": id,
        "status": status_name(&ticket),
    });
    envelope["metadata"] = json!({
        "owner_user": ticket.owner_user,
        "owner_role": ticket.owner_role,
        "session_id": ticket.session_id,
        "database_kind": ticket.database_kind,
        "created_at": ticket.created_at,
        "iteration_count": ticket.iteration_count,
    });
    Ok(Json(envelope).into_response())
}

/// `GET /queries/history`: most recent tickets for the caller.
pub async fn history(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    let entries = state.core.orchestrator().history(&auth.user, 20).await?;
    Ok(Json(json!({
        "status": "success",
        "queries": entries,
    }))
    .into_response())
}

fn authorize_ticket(state: &AppState, auth: &AuthContext, id: &str) -> Result<(), ApiError> {
    match state.core.events.get_metadata(id) {
        Some(metadata) if auth.may_access(&metadata.owner_user) => Ok(()),
        Some(_) => Err(ApiError(ParleQLError::ApprovalForbidden {
            query_id: id.to_string(),
        })),
        // Ticket may be resumed from a checkpoint after a restart; the
        // load path re-checks ownership.
        None => Ok(()),
    }
}
