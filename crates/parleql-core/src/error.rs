//! Error types for the `ParleQL` core.
//!
//! Every failure mode in the pipeline maps onto one variant here. The
//! orchestrator never lets these unwind across node boundaries (nodes
//! convert them into terminal ticket states), but collaborator shims,
//! caches, and the HTTP layer all speak this type directly.
//!
//! # Error Hierarchy
//!
//! ```text
//! ParleQLError
//! ├── Validation        - empty/oversized/rejected input
//! ├── InjectionBlocked  - SQL injection findings at blocking severity
//! ├── SchemaUnavailable - schema fetch/cache failure
//! ├── Llm               - provider failures (taxonomy in LlmFailure)
//! ├── ClarificationNeeded - recoverable: caller should clarify and resume
//! ├── InvalidIdentifiers  - generated SQL references unknown names
//! ├── CostBlocked       - cost estimate above the blocking level
//! ├── QuotaExceeded     - daily query quota exhausted
//! ├── Approval*         - HITL gate violations
//! ├── Execution*        - timeout / driver error / breaker open
//! ├── Cancelled         - cooperative cancellation
//! ├── IterationLimit    - state-machine loop prevention
//! ├── Unauthorized / NotFound
//! └── Internal          - unexpected internal errors
//! ```

use thiserror::Error;

/// Result type alias for `ParleQL` operations.
pub type Result<T> = std::result::Result<T, ParleQLError>;

/// Taxonomy of LLM provider failures, per the collaborator contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmFailure {
    /// Credentials rejected by the provider.
    Auth,
    /// Provider-side rate limit hit.
    RateLimited,
    /// The request exceeded the configured LLM timeout.
    Timeout,
    /// The provider answered but the payload was unusable.
    BadResponse,
    /// Anything else (network, 5xx, ...).
    Other,
}

/// Main error type for `ParleQL` operations.
#[derive(Error, Debug)]
pub enum ParleQLError {
    // ========================================================================
    // Input validation
    // ========================================================================
    /// The user query was empty after trimming.
    #[error("Validation error: query is empty")]
    ValidationEmpty,

    /// The user query exceeded the accepted size.
    #[error("Validation error: query is too long ({actual} bytes, max {max})")]
    ValidationTooLong {
        /// Actual size in bytes.
        actual: usize,
        /// Maximum accepted size in bytes.
        max:    usize,
    },

    /// SQL (generated or user-modified) was rejected by the validator.
    #[error("Validation error: {message}")]
    ValidationSqlRejected {
        /// Why the SQL was rejected, in user terms.
        message: String,
    },

    /// Injection scan found a blocking pattern.
    #[error("Query blocked: {message}")]
    InjectionBlocked {
        /// Short reason naming the pattern family.
        message: String,
    },

    // ========================================================================
    // Collaborators
    // ========================================================================
    /// Schema could not be fetched or deserialized.
    #[error("Schema unavailable for {database}: {message}")]
    SchemaUnavailable {
        /// Backend the schema was requested for.
        database: String,
        /// Fetch failure detail.
        message:  String,
    },

    /// The LLM provider failed.
    #[error("LLM unavailable: {message}")]
    LlmUnavailable {
        /// Sanitized provider message.
        message: String,
        /// Failure taxonomy bucket.
        taxonomy: LlmFailure,
    },

    /// The LLM returned an empty completion.
    #[error("LLM returned an empty response")]
    LlmEmpty,

    // ========================================================================
    // Pipeline outcomes
    // ========================================================================
    /// The pipeline needs more information from the user. Recoverable via
    /// the clarify endpoint; not a failure.
    #[error("Clarification needed: {message}")]
    ClarificationNeeded {
        /// Question to put to the user.
        message: String,
    },

    /// Generated SQL referenced identifiers not present in the schema.
    #[error("Invalid identifiers in generated SQL: {}", identifiers.join(", "))]
    InvalidIdentifiers {
        /// The offending names, in order of appearance.
        identifiers: Vec<String>,
    },

    /// Best-effort dialect conversion failed.
    #[error("Dialect conversion failed: {message}")]
    DialectConversionFailed {
        /// What could not be converted.
        message: String,
    },

    /// Cost estimate came back above the blocking level.
    #[error("Query blocked by cost estimate: {message}")]
    CostBlocked {
        /// Explanation with the estimated level.
        message: String,
    },

    /// The user's daily query quota is exhausted.
    #[error("Daily query quota exceeded ({used}/{quota})")]
    QuotaExceeded {
        /// Queries already issued today.
        used:  u64,
        /// The role's daily quota.
        quota: u64,
    },

    // ========================================================================
    // Approval gate
    // ========================================================================
    /// The ticket is waiting on a human decision.
    #[error("Approval required for query {query_id}")]
    ApprovalRequired {
        /// Ticket waiting for the decision.
        query_id: String,
    },

    /// A second decision was attempted on an already-decided approval.
    #[error("Approval for query {query_id} was already decided")]
    ApprovalDuplicate {
        /// Ticket whose approval was re-decided.
        query_id: String,
    },

    /// The caller may not decide this approval.
    #[error("Not allowed to decide approval for query {query_id}")]
    ApprovalForbidden {
        /// Ticket the caller tried to decide.
        query_id: String,
    },

    // ========================================================================
    // Execution
    // ========================================================================
    /// Query execution exceeded its timeout.
    #[error("Execution timeout after {timeout_ms}ms")]
    ExecutionTimeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The database driver reported an error.
    #[error("Execution error: {message}")]
    ExecutionError {
        /// Sanitized driver message.
        message: String,
    },

    /// The backend's circuit breaker is open.
    #[error("Service unavailable: circuit breaker open for {backend}")]
    BreakerOpen {
        /// Backend whose breaker rejected the call.
        backend: String,
    },

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The ticket was cancelled cooperatively.
    #[error("Query {query_id} cancelled: {reason}")]
    Cancelled {
        /// Ticket that was cancelled.
        query_id: String,
        /// Cancellation reason ("client disconnected", ...).
        reason:   String,
    },

    /// The state machine hit its iteration cap.
    #[error("Iteration limit reached ({max_iterations}); aborting to prevent a loop")]
    IterationLimit {
        /// The configured cap.
        max_iterations: u32,
    },

    /// The caller is not allowed to see or act on this resource.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// What was denied.
        message: String,
    },

    /// Unknown ticket or resource.
    #[error("{resource} not found: {identifier}")]
    NotFound {
        /// Resource type ("query", "connection", ...).
        resource:   String,
        /// Identifier that was looked up.
        identifier: String,
    },

    /// Unexpected internal error. Should be rare.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional source error for debugging.
        #[source]
        source:  Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ParleQLError {
    // ========================================================================
    // Constructor helpers
    // ========================================================================

    /// Create a generic SQL-rejected validation error.
    #[must_use]
    pub fn sql_rejected(message: impl Into<String>) -> Self {
        Self::ValidationSqlRejected {
            message: message.into(),
        }
    }

    /// Create an injection-blocked error.
    #[must_use]
    pub fn injection(message: impl Into<String>) -> Self {
        Self::InjectionBlocked {
            message: message.into(),
        }
    }

    /// Create a schema-unavailable error.
    #[must_use]
    pub fn schema_unavailable(database: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaUnavailable {
            database: database.into(),
            message:  message.into(),
        }
    }

    /// Create an LLM-unavailable error.
    #[must_use]
    pub fn llm(message: impl Into<String>, taxonomy: LlmFailure) -> Self {
        Self::LlmUnavailable {
            message: message.into(),
            taxonomy,
        }
    }

    /// Create a clarification request.
    #[must_use]
    pub fn clarification(message: impl Into<String>) -> Self {
        Self::ClarificationNeeded {
            message: message.into(),
        }
    }

    /// Create an execution error with a sanitized driver message.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(query_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            query_id: query_id.into(),
            reason:   reason.into(),
        }
    }

    /// Create an unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource:   resource.into(),
            identifier: identifier.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source:  None,
        }
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Check if this is a client error (4xx equivalent).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ValidationEmpty
                | Self::ValidationTooLong { .. }
                | Self::ValidationSqlRejected { .. }
                | Self::InjectionBlocked { .. }
                | Self::ClarificationNeeded { .. }
                | Self::InvalidIdentifiers { .. }
                | Self::CostBlocked { .. }
                | Self::QuotaExceeded { .. }
                | Self::ApprovalRequired { .. }
                | Self::ApprovalDuplicate { .. }
                | Self::ApprovalForbidden { .. }
                | Self::Unauthorized { .. }
                | Self::NotFound { .. }
        )
    }

    /// Check whether this error leaves the ticket in a recoverable state.
    ///
    /// Clarification is the only recoverable kind: the client can call the
    /// clarify endpoint and the pipeline resumes on the same thread.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ClarificationNeeded { .. })
    }

    /// Get the HTTP status code equivalent.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::ValidationEmpty
            | Self::ValidationTooLong { .. }
            | Self::ValidationSqlRejected { .. }
            | Self::InjectionBlocked { .. }
            | Self::ClarificationNeeded { .. }
            | Self::InvalidIdentifiers { .. }
            | Self::DialectConversionFailed { .. }
            | Self::CostBlocked { .. } => 400,
            Self::Unauthorized { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::ApprovalDuplicate { .. } => 409,
            Self::QuotaExceeded { .. } => 429,
            Self::BreakerOpen { .. } => 503,
            Self::ExecutionTimeout { .. } => 504,
            Self::ApprovalRequired { .. } | Self::ApprovalForbidden { .. } => 403,
            Self::SchemaUnavailable { .. }
            | Self::LlmUnavailable { .. }
            | Self::LlmEmpty
            | Self::ExecutionError { .. }
            | Self::Cancelled { .. }
            | Self::IterationLimit { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Get the stable error kind string used in response envelopes.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationEmpty => "validation_empty",
            Self::ValidationTooLong { .. } => "validation_too_long",
            Self::ValidationSqlRejected { .. } => "validation_sql_rejected",
            Self::InjectionBlocked { .. } => "injection_blocked",
            Self::SchemaUnavailable { .. } => "schema_unavailable",
            Self::LlmUnavailable { .. } => "llm_unavailable",
            Self::LlmEmpty => "llm_empty",
            Self::ClarificationNeeded { .. } => "clarification_needed",
            Self::InvalidIdentifiers { .. } => "invalid_identifiers",
            Self::DialectConversionFailed { .. } => "dialect_conversion_failed",
            Self::CostBlocked { .. } => "cost_blocked",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ApprovalDuplicate { .. } => "approval_duplicate",
            Self::ApprovalForbidden { .. } => "approval_forbidden",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::ExecutionError { .. } => "execution_error",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Cancelled { .. } => "cancelled",
            Self::IterationLimit { .. } => "iteration_limit",
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for ParleQLError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {e}"),
            source:  Some(Box::new(e)),
        }
    }
}

impl From<std::io::Error> for ParleQLError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {e}"),
            source:  Some(Box::new(e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
