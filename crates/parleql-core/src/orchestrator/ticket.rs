//! The durable unit of work.
//!
//! A [`QueryTicket`] carries everything a pipeline run accumulates:
//! routing decision, skills output, generated SQL, verdict, result. It
//! serializes to JSON for checkpointing; unknown fields are rejected so
//! a stale checkpoint cannot smuggle state into the machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseKind;
use crate::router::RoutingDecision;
use crate::sentiment::SentimentAssessment;
use crate::skills::{ClarificationRequest, SkillsOutput};
use crate::types::{
    new_query_id, ExecutionResult, GeneratedSql, LlmMetadata, UserRequest, Visualization,
};
use crate::validate::ValidationVerdict;

/// Where the machine goes next. Every node sets exactly one of these
/// before returning; the driver loop pattern-matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Classify intent.
    Route,
    /// Generate SQL.
    Synthesize,
    /// Run the safety pipeline.
    Validate,
    /// One bounded repair pass back through synthesis.
    Repair,
    /// Suspend for a human decision (interrupt-before).
    AwaitApproval,
    /// Dispatch to the backend.
    Execute,
    /// Bounded strategy-rotation retry back through synthesis.
    Pivot,
    /// Post-execution analysis.
    Analyze,
    /// Terminal: done. Success, reply, clarification, error, or
    /// rejection; the ticket's fields say which.
    Done,
}

/// Terminal disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Results delivered.
    Success,
    /// Conversational or metadata reply, no SQL.
    Reply,
    /// Waiting at the approval gate.
    PendingApproval,
    /// Needs a clarification round-trip.
    ClarificationNeeded,
    /// Pipeline error.
    Error,
    /// Human rejected.
    Rejected,
    /// Cancelled.
    Cancelled,
}

/// The durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryTicket {
    /// Opaque id, `[A-Za-z0-9_-]{8,64}`.
    pub id: String,
    /// Owning user.
    pub owner_user: String,
    /// Owner's role.
    pub owner_role: String,
    /// Session the ticket was created in.
    pub session_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Trace id threaded through spans and the Oracle bridge.
    pub trace_id: String,
    /// Target backend.
    pub database_kind: DatabaseKind,
    /// Client auto-approve preference.
    pub auto_approve: bool,
    /// Where the machine goes next.
    pub next_action: NextAction,
    /// Validate-entry counter (loop prevention).
    pub iteration_count: u32,
    /// Repair passes used (at most one).
    pub repair_count: u32,
    /// Pivot retries used.
    pub pivot_count: u32,
    /// The accepted request.
    pub request: UserRequest,
    /// Router output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    /// Sentiment assessment from routing time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentAssessment>,
    /// Skills output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<SkillsOutput>,
    /// Generated SQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<GeneratedSql>,
    /// Validator verdict (carries the final, rewritten SQL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<ValidationVerdict>,
    /// Execution result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    /// Chart suggestion and narrative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization: Option<Visualization>,
    /// Provider usage / failure envelope.
    #[serde(default)]
    pub llm_metadata: LlmMetadata,
    /// Whether a cost-aware rewrite replaced the SQL.
    #[serde(default)]
    pub cost_optimized: bool,
    /// Whether a human approved this ticket.
    #[serde(default)]
    pub approved: bool,
    /// Terminal disposition, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<Disposition>,
    /// User-facing error, when disposition is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error kind, when disposition is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Clarification, when disposition is `ClarificationNeeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,
    /// Reply text, when disposition is `Reply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    /// Accumulated non-fatal warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl QueryTicket {
    /// Create a fresh ticket at the head of the machine.
    #[must_use]
    pub fn new(
        owner_user: impl Into<String>,
        owner_role: impl Into<String>,
        session_id: impl Into<String>,
        database_kind: DatabaseKind,
        auto_approve: bool,
        request: UserRequest,
    ) -> Self {
        let id = new_query_id();
        Self {
            trace_id: format!("trace-{id}"),
            id,
            owner_user: owner_user.into(),
            owner_role: owner_role.into(),
            session_id: session_id.into(),
            created_at: Utc::now(),
            database_kind,
            auto_approve,
            next_action: NextAction::Route,
            iteration_count: 0,
            repair_count: 0,
            pivot_count: 0,
            request,
            routing: None,
            sentiment: None,
            skills: None,
            sql: None,
            verdict: None,
            result: None,
            visualization: None,
            llm_metadata: LlmMetadata::default(),
            cost_optimized: false,
            approved: false,
            disposition: None,
            error: None,
            error_kind: None,
            clarification: None,
            reply: None,
            warnings: Vec::new(),
        }
    }

    /// Mark a terminal error.
    pub fn fail(&mut self, kind: &str, message: impl Into<String>) {
        self.disposition = Some(Disposition::Error);
        self.error = Some(message.into());
        self.error_kind = Some(kind.to_string());
        self.next_action = NextAction::Done;
    }

    /// The SQL that would actually run: the verdict's rewritten text when
    /// present, otherwise the generated text.
    #[must_use]
    pub fn effective_sql(&self) -> Option<&str> {
        self.verdict
            .as_ref()
            .map(|v| v.final_sql.as_str())
            .or_else(|| self.sql.as_ref().map(|s| s.text.as_str()))
    }

    /// Serialize for checkpointing.
    pub fn to_checkpoint(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore from a checkpoint.
    pub fn from_checkpoint(state: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> QueryTicket {
        QueryTicket::new(
            "alice",
            "analyst",
            "s1",
            DatabaseKind::Postgres,
            false,
            UserRequest::new("total sales by region", Vec::new()).expect("valid"),
        )
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut t = ticket();
        t.iteration_count = 3;
        t.warnings.push("row limit enforced".to_string());
        let serialized = t.to_checkpoint().expect("serializes");
        let restored = QueryTicket::from_checkpoint(&serialized).expect("deserializes");
        assert_eq!(restored.id, t.id);
        assert_eq!(restored.iteration_count, 3);
        assert_eq!(restored.next_action, NextAction::Route);
        assert_eq!(restored.warnings, t.warnings);
    }

    #[test]
    fn unknown_checkpoint_fields_are_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_str(&ticket().to_checkpoint().expect("serializes")).expect("json");
        value["smuggled"] = serde_json::json!(true);
        assert!(QueryTicket::from_checkpoint(&value.to_string()).is_err());
    }

    #[test]
    fn fail_is_terminal() {
        let mut t = ticket();
        t.fail("llm_empty", "empty completion");
        assert_eq!(t.next_action, NextAction::Done);
        assert_eq!(t.disposition, Some(Disposition::Error));
        assert_eq!(t.error_kind.as_deref(), Some("llm_empty"));
    }

    #[test]
    fn generated_ids_validate() {
        let t = ticket();
        assert!(crate::types::validate_query_id(&t.id).is_ok());
    }
}
