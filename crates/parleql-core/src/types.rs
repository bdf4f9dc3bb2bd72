//! Shared data model for the pipeline.
//!
//! These are the structured records the orchestrator moves between nodes
//! and checkpoints. Boundaries reject unknown fields so a stale or
//! hand-edited checkpoint cannot smuggle state into the machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};

/// Lifecycle states published on the event bus, in SSE `event:` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Ticket accepted.
    Received,
    /// Routing / skills / synthesis in progress.
    Planning,
    /// SQL generated and validated.
    Prepared,
    /// Suspended at the approval gate.
    PendingApproval,
    /// Human approved; resuming.
    Approved,
    /// Query dispatched to the backend.
    Executing,
    /// Terminal: results delivered.
    Finished,
    /// Terminal: pipeline error.
    Error,
    /// Terminal: cancelled.
    Cancelled,
    /// Terminal: human rejected.
    Rejected,
}

impl QueryState {
    /// Whether this state closes the event stream.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Cancelled | Self::Rejected
        )
    }

    /// SSE `event:` name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Planning => "planning",
            Self::Prepared => "prepared",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn of prior conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatTurn {
    /// Who spoke.
    pub role:    ChatRole,
    /// What was said.
    pub content: String,
}

/// Conversation roles accepted in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The human.
    User,
    /// The gateway's prior answer.
    Assistant,
}

/// Maximum accepted size of the prompt and of each history turn, bytes.
pub const MAX_PROMPT_BYTES: usize = 10_000;
/// Maximum accepted history length.
pub const MAX_HISTORY_TURNS: usize = 50;

/// The natural-language prompt plus optional conversation history.
/// Immutable after acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRequest {
    /// The free-form business question.
    pub text:    String,
    /// Prior turns, oldest first.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

impl UserRequest {
    /// Accept and validate a request.
    pub fn new(text: impl Into<String>, history: Vec<ChatTurn>) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ParleQLError::ValidationEmpty);
        }
        if text.len() > MAX_PROMPT_BYTES {
            return Err(ParleQLError::ValidationTooLong {
                actual: text.len(),
                max:    MAX_PROMPT_BYTES,
            });
        }
        if history.len() > MAX_HISTORY_TURNS {
            return Err(ParleQLError::ValidationTooLong {
                actual: history.len(),
                max:    MAX_HISTORY_TURNS,
            });
        }
        for turn in &history {
            if turn.content.len() > MAX_PROMPT_BYTES {
                return Err(ParleQLError::ValidationTooLong {
                    actual: turn.content.len(),
                    max:    MAX_PROMPT_BYTES,
                });
            }
        }
        Ok(Self { text, history })
    }
}

/// Generated SQL and its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratedSql {
    /// The SQL text, post-processed and normalized.
    pub text: String,
    /// Generator confidence, 0-100.
    pub confidence: u8,
    /// Dialect the SQL targets.
    pub dialect: DatabaseKind,
    /// Whether identifier normalization ran over the text.
    pub identifiers_normalized: bool,
    /// Set when a best-effort dialect conversion produced this text.
    pub dialect_converted_from: Option<DatabaseKind>,
    /// Whether the text came from the fingerprint cache (LLM skipped).
    pub was_cached: bool,
}

/// Execution outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Rows returned.
    Success,
    /// Driver error.
    Error,
    /// Execution timed out.
    Timeout,
    /// Execution was cancelled.
    Cancelled,
    /// Blocked before dispatch (breaker, validation bug).
    Blocked,
}

/// Result-cache disposition for a returned result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Executed and inserted into the cache.
    Fresh,
    /// Served from the cache.
    Hit,
    /// Cache consulted, executed, not inserted (e.g. non-success).
    Miss,
    /// Cache skipped (KV degraded or caching disabled).
    Bypass,
}

/// Optional post-execution quality stats attached by the analyze node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataQuality {
    /// Per-column null counts, aligned with `ExecutionResult::columns`.
    pub null_counts: Vec<u64>,
    /// Number of fully duplicated rows.
    pub duplicate_rows: u64,
}

/// Canonical tabular result, identical across backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionResult {
    /// Column names, ordered.
    pub columns: Vec<String>,
    /// Row tuples; each row has `columns.len()` entries.
    pub rows: Vec<Vec<JsonValue>>,
    /// Invariant: equals `rows.len()`.
    pub row_count: usize,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// Outcome status.
    pub status: ExecutionStatus,
    /// Optional nullability/duplicate stats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<DataQuality>,
    /// Result-cache disposition.
    pub cache_status: CacheStatus,
}

impl ExecutionResult {
    /// Build a successful result, fixing `row_count` to the row list.
    #[must_use]
    pub fn success(columns: Vec<String>, rows: Vec<Vec<JsonValue>>, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            status: ExecutionStatus::Success,
            data_quality: None,
            cache_status: CacheStatus::Bypass,
        }
    }

    /// An empty non-success result.
    #[must_use]
    pub fn empty(status: ExecutionStatus) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms: 0,
            status,
            data_quality: None,
            cache_status: CacheStatus::Bypass,
        }
    }
}

/// One SSE frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventRecord {
    /// The ticket this frame belongs to.
    pub ticket_id: String,
    /// Lifecycle state.
    pub state: QueryState,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// State-specific payload.
    pub payload: JsonValue,
}

impl EventRecord {
    /// Render as a wire-level SSE frame: `event:` line, `data:` line,
    /// blank-line terminator.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(&serde_json::json!({
            "ticket_id": self.ticket_id,
            "state": self.state,
            "timestamp": self.timestamp.to_rfc3339(),
            "payload": self.payload,
        }))
        .unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.state.as_str(), data)
    }
}

/// Provider usage and failure details surfaced in response envelopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmMetadata {
    /// Prompt tokens consumed, when the provider reports usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Completion tokens consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Generation wall-clock duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Whether the SQL came from the fingerprint cache.
    #[serde(default)]
    pub was_cached: bool,
    /// Present when the pipeline failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

/// Failure envelope carried under `llm_metadata.error_details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorDetails {
    /// Short, filtered reason.
    pub message: String,
    /// The stage the pipeline failed at.
    pub failed_at: String,
    /// SQL in flight when the failure occurred, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_attempted: Option<String>,
    /// Stable error kind (see [`ParleQLError::error_code`]).
    pub error_taxonomy: String,
}

/// Chart suggestion inferred from the result shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Visualization {
    /// Suggested chart kind.
    pub kind: ChartKind,
    /// Column suggested for the x axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    /// Column suggested for the y axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    /// Why this chart fits.
    pub reason: String,
    /// One-sentence narrative summary of the result.
    pub narrative: String,
}

/// Chart kinds the front end understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    /// Categorical bars.
    Bar,
    /// Time series.
    Line,
    /// Share-of-whole.
    Pie,
    /// Plain table.
    Table,
}

/// Validate a client-supplied or generated query id.
///
/// Format: `^[A-Za-z0-9_-]{8,64}$`.
pub fn validate_query_id(id: &str) -> Result<()> {
    let ok = (8..=64).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ParleQLError::sql_rejected(format!(
            "malformed query id '{id}'"
        )))
    }
}

/// Generate a fresh query id.
#[must_use]
pub fn new_query_id() -> String {
    format!("q_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(QueryState::Finished.is_terminal());
        assert!(QueryState::Rejected.is_terminal());
        assert!(!QueryState::PendingApproval.is_terminal());
    }

    #[test]
    fn user_request_rejects_empty_and_oversized() {
        assert!(matches!(
            UserRequest::new("   ", Vec::new()),
            Err(ParleQLError::ValidationEmpty)
        ));
        let big = "x".repeat(MAX_PROMPT_BYTES + 1);
        assert!(matches!(
            UserRequest::new(big, Vec::new()),
            Err(ParleQLError::ValidationTooLong { .. })
        ));
    }

    #[test]
    fn query_id_format() {
        assert!(validate_query_id("q_abc12345").is_ok());
        assert!(validate_query_id(&new_query_id()).is_ok());
        assert!(validate_query_id("short").is_err());
        assert!(validate_query_id("has space 123").is_err());
        assert!(validate_query_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn sse_frame_shape() {
        let record = EventRecord {
            ticket_id: "q_abc12345".to_string(),
            state:     QueryState::Received,
            timestamp: Utc::now(),
            payload:   serde_json::json!({}),
        };
        let frame = record.to_sse_frame();
        assert!(frame.starts_with("event: received\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn success_result_fixes_row_count() {
        let result = ExecutionResult::success(
            vec!["a".to_string()],
            vec![vec![serde_json::json!(1)], vec![serde_json::json!(2)]],
            5,
        );
        assert_eq!(result.row_count, result.rows.len());
    }
}
