//! Test utilities and mock collaborators for the ParleQL ecosystem.
//!
//! Everything here implements the core's collaborator traits with
//! scriptable, inspectable in-memory behavior: an LLM that replays
//! canned completions, a database driver that serves a fixed catalog and
//! recorded results, a cost estimator that returns whatever the test
//! says, and an RLS service that appends a predicate.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use parleql_core::cost::{CostEstimate, CostEstimator, CostLevel};
use parleql_core::dialect::DatabaseKind;
use parleql_core::driver::{ColumnDescriptor, DatabaseDriver};
use parleql_core::error::{LlmFailure, ParleQLError, Result};
use parleql_core::llm::{LlmMessage, LlmOptions, LlmProvider, LlmResponse, LlmUsage};
use parleql_core::rls::{RlsOutcome, RlsService};
use parleql_core::types::ExecutionResult;

// ============================================================================
// Scripted LLM
// ============================================================================

enum ScriptedReply {
    Content(String),
    Failure(LlmFailure, String),
}

/// An LLM provider that replays queued completions in order.
///
/// When the queue runs dry it fails with `bad_response`, which makes a
/// test that under-scripts its LLM fail loudly instead of hanging.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<Vec<LlmMessage>>>,
}

impl ScriptedLlm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completion.
    #[must_use]
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.replies
            .lock()
            .push_back(ScriptedReply::Content(content.into()));
        self
    }

    /// Queue a SQL completion with the confidence marker appended.
    #[must_use]
    pub fn reply_sql(self, sql: impl Into<String>, confidence: u8) -> Self {
        let sql = sql.into();
        self.reply(format!("{sql}\n-- CONFIDENCE: {confidence}%"))
    }

    /// Queue a provider failure.
    #[must_use]
    pub fn fail(self, taxonomy: LlmFailure, message: impl Into<String>) -> Self {
        self.replies
            .lock()
            .push_back(ScriptedReply::Failure(taxonomy, message.into()));
        self
    }

    /// Prompts captured so far, for assertions on prompt composition.
    #[must_use]
    pub fn captured_prompts(&self) -> Vec<Vec<LlmMessage>> {
        self.prompts.lock().clone()
    }

    /// How many invocations happened.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn invoke(
        &self,
        messages: &[LlmMessage],
        _options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        if cancel.is_cancelled() {
            return Err(ParleQLError::cancelled("scripted", "cancelled"));
        }
        self.prompts.lock().push(messages.to_vec());
        match self.replies.lock().pop_front() {
            Some(ScriptedReply::Content(content)) => Ok(LlmResponse {
                content,
                usage: Some(LlmUsage {
                    input_tokens: 120,
                    output_tokens: 40,
                }),
            }),
            Some(ScriptedReply::Failure(taxonomy, message)) => {
                Err(ParleQLError::llm(message, taxonomy))
            }
            None => Err(ParleQLError::llm(
                "scripted LLM ran out of replies",
                LlmFailure::BadResponse,
            )),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Scripted database driver
// ============================================================================

/// A database driver with a fixed catalog and scriptable results.
///
/// Catalog queries (table listing, describe) answer from the configured
/// tables; everything else pops the result queue, falling back to a
/// small default result. Executed SQL is recorded for assertions.
pub struct ScriptedDriver {
    kind: DatabaseKind,
    tables: Vec<(String, Vec<ColumnDescriptor>)>,
    results: Mutex<VecDeque<Result<ExecutionResult>>>,
    executed: Mutex<Vec<String>>,
    cancelled_sessions: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    #[must_use]
    pub fn new(kind: DatabaseKind) -> Self {
        Self {
            kind,
            tables: Vec::new(),
            results: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            cancelled_sessions: Mutex::new(Vec::new()),
        }
    }

    /// Add a table to the catalog. Columns are `(name, type, nullable)`.
    #[must_use]
    pub fn with_table(mut self, name: &str, columns: &[(&str, &str, bool)]) -> Self {
        self.tables.push((
            name.to_string(),
            columns
                .iter()
                .map(|(n, t, nullable)| ColumnDescriptor {
                    name: (*n).to_string(),
                    data_type: (*t).to_string(),
                    nullable: *nullable,
                })
                .collect(),
        ));
        self
    }

    /// Queue an execution result.
    #[must_use]
    pub fn with_result(self, result: ExecutionResult) -> Self {
        self.results.lock().push_back(Ok(result));
        self
    }

    /// Queue an execution failure.
    #[must_use]
    pub fn with_error(self, error: ParleQLError) -> Self {
        self.results.lock().push_back(Err(error));
        self
    }

    /// Every non-catalog SQL executed, in order.
    #[must_use]
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Sessions the facade asked to kill.
    #[must_use]
    pub fn cancelled_sessions(&self) -> Vec<String> {
        self.cancelled_sessions.lock().clone()
    }

    fn is_catalog_query(sql: &str) -> bool {
        let upper = sql.to_ascii_uppercase();
        upper.contains("USER_TABLES") || upper.contains("PG_TABLES") || upper.starts_with("SHOW TABLES")
    }

    fn is_sample_probe(sql: &str) -> bool {
        let upper = sql.to_ascii_uppercase();
        upper.starts_with("SELECT * FROM")
            && (upper.contains("LIMIT") || upper.contains("FETCH FIRST"))
    }
}

#[async_trait]
impl DatabaseDriver for ScriptedDriver {
    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<ExecutionResult> {
        if Self::is_catalog_query(sql) {
            let rows: Vec<Vec<JsonValue>> = self
                .tables
                .iter()
                .map(|(name, _)| vec![json!(name)])
                .collect();
            return Ok(ExecutionResult::success(
                vec!["table_name".to_string()],
                rows,
                1,
            ));
        }
        if Self::is_sample_probe(sql) {
            // Sample probes enrich prompts; they never consume scripted
            // results.
            return Ok(ExecutionResult::success(Vec::new(), Vec::new(), 1));
        }
        self.executed.lock().push(sql.to_string());
        match self.results.lock().pop_front() {
            Some(result) => result,
            None => Ok(ExecutionResult::success(
                vec!["value".to_string()],
                vec![vec![json!(1)]],
                1,
            )),
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.cancelled_sessions.lock().push(session_id.to_string());
        Ok(())
    }

    async fn describe(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        self.tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, columns)| columns.clone())
            .ok_or_else(|| ParleQLError::not_found("table", table))
    }

    fn kind(&self) -> DatabaseKind {
        self.kind
    }
}

/// The `orders` fixture most tests use: region, sales amount, revenue,
/// and an order date. Names are reported in the backend's canonical
/// case: upper for Oracle, lower for Postgres/Doris.
#[must_use]
pub fn orders_driver(kind: DatabaseKind) -> ScriptedDriver {
    let (table, columns): (&str, [(&str, &str, bool); 4]) = match kind {
        DatabaseKind::Oracle => (
            "ORDERS",
            [
                ("REGION", "VARCHAR2(64)", true),
                ("SALES_AMOUNT", "NUMBER(12,2)", true),
                ("REVENUE", "NUMBER(12,2)", true),
                ("ORDER_DATE", "DATE", false),
            ],
        ),
        DatabaseKind::Postgres | DatabaseKind::Doris => (
            "orders",
            [
                ("region", "character varying(64)", true),
                ("sales_amount", "numeric(12,2)", true),
                ("revenue", "numeric(12,2)", true),
                ("order_date", "date", false),
            ],
        ),
    };
    ScriptedDriver::new(kind).with_table(table, &columns)
}

/// A plausible two-row result for the orders fixture.
#[must_use]
pub fn orders_result() -> ExecutionResult {
    ExecutionResult::success(
        vec!["region".to_string(), "total_sales".to_string()],
        vec![
            vec![json!("EU"), json!(1250.5)],
            vec![json!("US"), json!(980.0)],
        ],
        42,
    )
}

// ============================================================================
// Cost estimator and RLS fakes
// ============================================================================

/// Cost estimator returning a queue of fixed estimates (falling back to
/// a benign LOW estimate).
#[derive(Default)]
pub struct FixedCostEstimator {
    estimates: Mutex<VecDeque<CostEstimate>>,
}

impl FixedCostEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an estimate.
    #[must_use]
    pub fn with_estimate(self, estimate: CostEstimate) -> Self {
        self.estimates.lock().push_back(estimate);
        self
    }

    /// A quick estimate literal.
    #[must_use]
    pub fn estimate(level: CostLevel, cardinality: u64, has_full_scan: bool) -> CostEstimate {
        CostEstimate {
            total_cost: 100.0,
            cardinality,
            level,
            has_full_scan,
            warnings: Vec::new(),
            recommendations: Vec::new(),
            plan: None,
        }
    }
}

#[async_trait]
impl CostEstimator for FixedCostEstimator {
    async fn estimate(
        &self,
        _sql: &str,
        _dialect: DatabaseKind,
        _include_plan: bool,
    ) -> Result<CostEstimate> {
        Ok(self
            .estimates
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::estimate(CostLevel::Low, 10, false)))
    }
}

/// RLS service that appends a per-user predicate to every query.
pub struct PredicateRls;

#[async_trait]
impl RlsService for PredicateRls {
    async fn enforce(
        &self,
        sql: &str,
        user_id: &str,
        _role: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<RlsOutcome> {
        let modified = format!("SELECT * FROM ({sql}) rls_wrapped WHERE owner_id = '{user_id}'");
        Ok(RlsOutcome {
            modified_sql: modified,
            applied: true,
            reason: "owner filter applied".to_string(),
            policies_applied: vec!["owner_only".to_string()],
        })
    }
}

// ============================================================================
// Assembled cores
// ============================================================================

/// A core wired entirely with in-memory fakes plus the given LLM and a
/// Postgres orders fixture. The driver handle is returned for
/// assertions.
#[must_use]
pub fn orders_core(
    llm: ScriptedLlm,
    config: parleql_core::CoreConfig,
) -> (Arc<parleql_core::Core>, Arc<ScriptedDriver>) {
    let driver = Arc::new(orders_driver(DatabaseKind::Postgres));
    let core = parleql_core::Core::builder(config).llm(Arc::new(llm)).build();
    core.executor
        .register_backend(DatabaseKind::Postgres, Arc::clone(&driver) as Arc<dyn DatabaseDriver>, None);
    (Arc::new(core), driver)
}
