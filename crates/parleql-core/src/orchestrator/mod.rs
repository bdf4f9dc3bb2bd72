//! The durable, resumable state machine.
//!
//! Each node reads the ticket, does its work, mutates the ticket, and
//! sets `next_action`; the driver loop pattern-matches. Nothing is ever
//! thrown across a node boundary; failures become terminal ticket
//! state. After every node the ticket is checkpointed under
//! `thread_id = ticket_id`, so an approval (or a clarify round-trip on
//! the same thread) resumes exactly where the machine paused.
//!
//! ```text
//! receive -> route
//! route   -> {reply, synthesize, clarify}
//! synthesize -> {validate, clarify, error}
//! validate   -> {execute, await_approval, clarify, error, repair}
//! repair     -> synthesize   (<= 1 per ticket)
//! await_approval -> {execute, rejected}    (interrupt-before)
//! execute    -> {analyze, error, pivot}
//! pivot      -> synthesize   (<= max_pivots, strategy rotation)
//! analyze    -> finished
//! ```

pub mod ticket;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::analyze;
use crate::core::Core;
use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};
use crate::events::TicketMetadata;
use crate::router::{Intent, IntentRouter};
use crate::schema::SchemaSnapshot;
use crate::skills::{self, ClarificationRequest};
use crate::synth::{SynthContext, SynthOutcome};
use crate::types::{ChatRole, ChatTurn, QueryState, UserRequest};
use crate::validate::ValidateContext;

pub use ticket::{Disposition, NextAction, QueryTicket};

/// Checkpoint write retries.
const CHECKPOINT_ATTEMPTS: u32 = 3;

/// Parameters for a new submission.
pub struct SubmitParams {
    /// Calling user.
    pub user: String,
    /// Caller's role.
    pub role: String,
    /// Session id.
    pub session_id: String,
    /// Client IP (approval audit trail).
    pub ip: String,
    /// Client user agent (approval audit trail).
    pub user_agent: String,
    /// Target backend.
    pub database: DatabaseKind,
    /// Client auto-approve preference; `None` takes the configured
    /// default.
    pub auto_approve: Option<bool>,
    /// The question.
    pub text: String,
    /// Prior conversation.
    pub history: Vec<ChatTurn>,
}

/// A human decision on a pending approval.
pub struct ApprovalDecision {
    /// Approve or reject.
    pub approved: bool,
    /// Replacement SQL; re-validated before execution.
    pub modified_sql: Option<String>,
    /// Reason, recorded on rejection.
    pub rejection_reason: Option<String>,
}

/// One history listing entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    /// Ticket id.
    pub query_id: String,
    /// Terminal or current status.
    pub status: String,
    /// Creation time.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Backend.
    pub database_kind: DatabaseKind,
}

/// Outcome handed back to the HTTP layer.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The ticket in its final (or suspended) state.
    pub ticket: QueryTicket,
}

impl PipelineOutcome {
    /// Effective disposition, treating a suspended ticket as pending.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        if let Some(d) = self.ticket.disposition {
            return d;
        }
        if self.ticket.next_action == NextAction::AwaitApproval {
            Disposition::PendingApproval
        } else {
            Disposition::Error
        }
    }
}

/// The orchestrator: a borrowed view over the composition root.
pub struct Orchestrator<'a> {
    core: &'a Core,
}

impl<'a> Orchestrator<'a> {
    /// Create over a composition root.
    #[must_use]
    pub fn new(core: &'a Core) -> Self {
        Self { core }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Accept a new submission and run it to suspension or completion.
    pub async fn submit(&self, params: SubmitParams) -> Result<PipelineOutcome> {
        let request = UserRequest::new(params.text, params.history)?;
        let auto_approve = params
            .auto_approve
            .unwrap_or(self.core.config.auto_approve_default);
        let mut ticket = QueryTicket::new(
            &params.user,
            &params.role,
            &params.session_id,
            params.database,
            auto_approve,
            request,
        );

        let cancel = CancellationToken::new();
        self.core.events.register(
            &ticket.id,
            TicketMetadata {
                owner_user: params.user.clone(),
                owner_role: params.role.clone(),
                session_id: params.session_id.clone(),
                database_kind: params.database.as_str().to_string(),
                ip: params.ip.clone(),
                user_agent: params.user_agent.clone(),
            },
            cancel.clone(),
        );
        self.core
            .events
            .publish(&ticket.id, QueryState::Received, json!({"query": ticket.request.text}));

        // Pre-LLM defense: the raw text is scanned before any provider
        // money is spent.
        let pre_scan = crate::validate::injection::scan_user_text(&ticket.request.text);
        if pre_scan.has_blocking_finding() {
            let kinds: Vec<&str> = pre_scan.findings.iter().map(|f| f.kind.as_str()).collect();
            warn!(ticket_id = %ticket.id, kinds = ?kinds, "submission blocked pre-LLM");
            let message = format!("request blocked by injection scan: {}", kinds.join(", "));
            ticket.llm_metadata.error_details = Some(crate::types::ErrorDetails {
                message: message.clone(),
                failed_at: "receive".to_string(),
                sql_attempted: None,
                error_taxonomy: "injection_blocked".to_string(),
            });
            ticket.fail("injection_blocked", message);
        }

        self.run(ticket, cancel).await
    }

    /// Decide a pending approval and resume the machine.
    pub async fn approve(
        &self,
        ticket_id: &str,
        decision: ApprovalDecision,
    ) -> Result<PipelineOutcome> {
        crate::types::validate_query_id(ticket_id)?;
        self.core.approvals.decide(ticket_id)?;
        let mut ticket = self.load(ticket_id).await?;
        if ticket.next_action != NextAction::AwaitApproval {
            return Err(ParleQLError::ApprovalDuplicate {
                query_id: ticket_id.to_string(),
            });
        }
        let cancel = self
            .core
            .events
            .cancel_token(ticket_id)
            .unwrap_or_default();

        if decision.approved {
            ticket.approved = true;
            // Feed adaptive HITL with the approved table set.
            self.core
                .validator
                .record_approval(&ticket.owner_user, &approved_tables(&ticket))
                .await;
            self.core
                .events
                .publish(ticket_id, QueryState::Approved, json!({}));
            match decision.modified_sql {
                Some(modified) => {
                    if let Some(sql) = &mut ticket.sql {
                        sql.text = modified;
                        sql.identifiers_normalized = false;
                        sql.was_cached = false;
                    }
                    ticket.verdict = None;
                    ticket.next_action = NextAction::Validate;
                }
                None => ticket.next_action = NextAction::Execute,
            }
            self.run(ticket, cancel).await
        } else {
            if let Some(reason) = decision.rejection_reason {
                ticket.warnings.push(format!("rejected: {reason}"));
            }
            ticket.disposition = Some(Disposition::Rejected);
            ticket.next_action = NextAction::Done;
            self.run(ticket, cancel).await
        }
    }

    /// Cancel a ticket. Returns false when the ticket is unknown.
    pub async fn cancel(&self, ticket_id: &str) -> Result<bool> {
        let Some(cancel) = self.core.events.cancel_token(ticket_id) else {
            return Ok(false);
        };
        cancel.cancel();
        let state = self.core.events.get_state(ticket_id);
        if state.is_none_or(|s| !s.is_terminal()) {
            self.core
                .events
                .publish(ticket_id, QueryState::Cancelled, json!({}));
        }
        if let Ok(mut ticket) = self.load(ticket_id).await {
            ticket.disposition = Some(Disposition::Cancelled);
            ticket.next_action = NextAction::Done;
            let _ = self.checkpoint(&ticket).await;
        }
        self.core.approvals.remove(ticket_id);
        Ok(true)
    }

    /// Resume a clarified question on the same thread: prior context is
    /// kept as history, the pipeline restarts from routing.
    pub async fn clarify(
        &self,
        ticket_id: &str,
        clarification: &str,
        original_query: Option<&str>,
    ) -> Result<PipelineOutcome> {
        crate::types::validate_query_id(ticket_id)?;
        let previous = self.load(ticket_id).await?;

        let original = original_query.unwrap_or(&previous.request.text);
        let combined = format!("{original}. {clarification}");
        let mut history = previous.request.history.clone();
        history.push(ChatTurn {
            role: ChatRole::User,
            content: previous.request.text.clone(),
        });
        if let Some(prior_clarification) = &previous.clarification {
            history.push(ChatTurn {
                role: ChatRole::Assistant,
                content: prior_clarification.message.clone(),
            });
        }
        let request = UserRequest::new(combined, history)?;

        let mut ticket = QueryTicket::new(
            &previous.owner_user,
            &previous.owner_role,
            &previous.session_id,
            previous.database_kind,
            previous.auto_approve,
            request,
        );
        // Same thread id: the new run overwrites the old checkpoint and
        // keeps the conversation context.
        ticket.id = previous.id.clone();
        ticket.trace_id = previous.trace_id.clone();

        let prior_metadata = self.core.events.get_metadata(&ticket.id).unwrap_or_default();
        self.core.events.remove(&ticket.id);
        let cancel = CancellationToken::new();
        self.core.events.register(
            &ticket.id,
            TicketMetadata {
                owner_user: ticket.owner_user.clone(),
                owner_role: ticket.owner_role.clone(),
                session_id: ticket.session_id.clone(),
                database_kind: ticket.database_kind.as_str().to_string(),
                ip: prior_metadata.ip,
                user_agent: prior_metadata.user_agent,
            },
            cancel.clone(),
        );
        self.core
            .events
            .publish(&ticket.id, QueryState::Received, json!({"query": ticket.request.text}));
        self.run(ticket, cancel).await
    }

    /// Most recent tickets for a user, newest first.
    pub async fn history(&self, user: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut out = Vec::new();
        for thread_id in self.core.checkpointer.list("").await? {
            let Ok(Some(checkpoint)) = self.core.checkpointer.get(&thread_id).await else {
                continue;
            };
            let Ok(ticket) = QueryTicket::from_checkpoint(&checkpoint.state) else {
                continue;
            };
            if ticket.owner_user != user {
                continue;
            }
            out.push(HistoryEntry {
                query_id: ticket.id.clone(),
                status: disposition_name(&ticket).to_string(),
                created_at: ticket.created_at,
                database_kind: ticket.database_kind,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Load a ticket from its checkpoint.
    pub async fn load(&self, ticket_id: &str) -> Result<QueryTicket> {
        let checkpoint = self
            .core
            .checkpointer
            .get(ticket_id)
            .await?
            .ok_or_else(|| ParleQLError::not_found("query", ticket_id))?;
        QueryTicket::from_checkpoint(&checkpoint.state)
    }

    // ========================================================================
    // Driver loop
    // ========================================================================

    async fn run(
        &self,
        mut ticket: QueryTicket,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        let span = info_span!("pipeline", query_id = %ticket.id, trace_id = %ticket.trace_id);
        async {
            let mut schema: Option<Arc<SchemaSnapshot>> = None;
            // Backstop well above the validate-entry cap; a bug in edge
            // wiring must not spin forever.
            let step_cap = self.core.config.max_iterations.saturating_mul(3).max(16);
            let mut steps = 0_u32;

            loop {
                steps += 1;
                if steps > step_cap {
                    ticket.fail(
                        "iteration_limit",
                        format!("pipeline exceeded {step_cap} steps"),
                    );
                }
                if cancel.is_cancelled() && ticket.disposition.is_none() {
                    ticket.disposition = Some(Disposition::Cancelled);
                    ticket.next_action = NextAction::Done;
                }

                match ticket.next_action {
                    NextAction::Route => self.node_route(&mut ticket, &mut schema, &cancel).await,
                    NextAction::Synthesize => {
                        self.node_synthesize(&mut ticket, &mut schema, &cancel).await;
                    }
                    NextAction::Validate => {
                        self.node_validate(&mut ticket, &mut schema, &cancel).await;
                    }
                    NextAction::Repair => {
                        debug!("repair pass: regenerating SQL");
                        ticket.next_action = NextAction::Synthesize;
                    }
                    NextAction::Pivot => {
                        debug!(pivot = ticket.pivot_count, "pivot pass: rotating strategy");
                        ticket.next_action = NextAction::Synthesize;
                    }
                    NextAction::AwaitApproval => {
                        if ticket.approved {
                            ticket.next_action = NextAction::Execute;
                        } else {
                            // Interrupt-before: persist, announce, return.
                            let metadata = self
                                .core
                                .events
                                .get_metadata(&ticket.id)
                                .unwrap_or_default();
                            self.core.approvals.register(
                                &ticket.id,
                                &ticket.session_id,
                                &metadata.ip,
                                &metadata.user_agent,
                                ticket.effective_sql().unwrap_or_default(),
                            );
                            self.core.events.publish(
                                &ticket.id,
                                QueryState::PendingApproval,
                                json!({
                                    "sql": ticket.effective_sql(),
                                    "risk_reasons": ticket
                                        .verdict
                                        .as_ref()
                                        .map(|v| v.risk_reasons.clone())
                                        .unwrap_or_default(),
                                }),
                            );
                            self.checkpoint(&ticket).await?;
                            info!("suspended at approval gate");
                            return Ok(PipelineOutcome { ticket });
                        }
                    }
                    NextAction::Execute => self.node_execute(&mut ticket, &cancel).await,
                    NextAction::Analyze => Self::node_analyze(&mut ticket),
                    NextAction::Done => {
                        self.finalize(&ticket).await;
                        self.publish_terminal(&ticket);
                        self.checkpoint(&ticket).await?;
                        return Ok(PipelineOutcome { ticket });
                    }
                }

                self.checkpoint(&ticket).await?;
            }
        }
        .instrument(span)
        .await
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn node_route(
        &self,
        ticket: &mut QueryTicket,
        schema: &mut Option<Arc<SchemaSnapshot>>,
        cancel: &CancellationToken,
    ) {
        self.core
            .events
            .publish(&ticket.id, QueryState::Planning, json!({"stage": "route"}));

        // Sentiment is assessed once, at routing time; the assessment
        // drives response adaptation for the rest of the run.
        let assessment = self
            .core
            .sentiment
            .assess(&ticket.owner_user, &ticket.request.text)
            .await;
        if assessment.should_escalate {
            ticket
                .warnings
                .push("repeated frustration detected; human follow-up recommended".to_string());
        }
        ticket.sentiment = Some(assessment);

        let snapshot = match self.ensure_schema(ticket.database_kind, schema).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(error = %e, "schema unavailable at routing; classifying without it");
                None
            }
        };

        let decision = self
            .core
            .router
            .classify(
                self.core.llm.as_ref(),
                &ticket.request.text,
                &ticket.request.history,
                snapshot.as_deref(),
                cancel,
            )
            .await;

        match decision.intent {
            Intent::Conversational | Intent::Ambiguous => {
                ticket.reply = decision.canned_reply.clone();
                ticket.disposition = Some(Disposition::Reply);
                ticket.next_action = NextAction::Done;
            }
            Intent::MetadataQuery => match snapshot {
                Some(snapshot) => {
                    ticket.reply =
                        Some(IntentRouter::metadata_reply(&ticket.request.text, &snapshot));
                    ticket.disposition = Some(Disposition::Reply);
                    ticket.next_action = NextAction::Done;
                }
                None => ticket.fail(
                    "schema_unavailable",
                    format!("schema for {} is unavailable", ticket.database_kind),
                ),
            },
            Intent::DataQuery => {
                ticket.next_action = NextAction::Synthesize;
            }
        }
        ticket.routing = Some(decision);
    }

    async fn node_synthesize(
        &self,
        ticket: &mut QueryTicket,
        schema: &mut Option<Arc<SchemaSnapshot>>,
        cancel: &CancellationToken,
    ) {
        let snapshot = match self.ensure_schema(ticket.database_kind, schema).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                ticket.fail("schema_unavailable", e.to_string());
                return;
            }
        };

        let skills_out = skills::resolve(&ticket.request.text, &snapshot, ticket.database_kind);
        if !skills_out.ok {
            let mut clarification = skills_out
                .clarification
                .clone()
                .unwrap_or_else(|| ClarificationRequest {
                    message: "Could you name the tables and columns to use?".to_string(),
                    referenced_tables: Vec::new(),
                    unmapped_concepts: Vec::new(),
                });
            if let Some(assessment) = &ticket.sentiment {
                clarification.message =
                    crate::sentiment::simplify_clarification(&clarification.message, assessment);
            }
            ticket.skills = Some(skills_out);
            ticket.clarification = Some(clarification);
            ticket.disposition = Some(Disposition::ClarificationNeeded);
            ticket.next_action = NextAction::Done;
            return;
        }
        ticket.skills = Some(skills_out);

        let limits = self.core.config.limits_for_role(&ticket.owner_role);
        let mut scope_constraints = vec![
            format!("use at most {} tables and {} joins", limits.max_tables, limits.max_joins),
        ];
        if let Some(cap) = limits.max_rows {
            scope_constraints.push(format!("never return more than {cap} rows"));
        }
        if ticket.pivot_count > 0 {
            scope_constraints.push(format!(
                "previous attempt {} failed at execution; formulate the query differently \
                 (alternative join path or aggregation)",
                ticket.pivot_count
            ));
        }
        if ticket.repair_count > 0 {
            scope_constraints
                .push("the previous SQL failed structural validation; keep it simple".to_string());
        }

        // Enrich the prompt's schema view with sample rows for the
        // tables the mappings reference.
        let mut prompt_schema = (*snapshot).clone();
        if let Some(driver) = self.core.executor.driver_for(ticket.database_kind) {
            let referenced: Vec<String> = ticket
                .skills
                .as_ref()
                .map(|s| {
                    s.mappings
                        .iter()
                        .map(|m| m.table.clone())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            for table in referenced {
                if prompt_schema.samples.contains_key(&table) {
                    continue;
                }
                let rows = self
                    .core
                    .schema
                    .sample_rows(ticket.database_kind, &driver, &table, 2)
                    .await;
                if !rows.is_empty() {
                    prompt_schema.samples.insert(table, rows);
                }
            }
        }
        // Skills learned from prior successful queries ride in as
        // derived-column hints.
        for (table, hint) in self.core.skill_generator.learned_hints().await {
            if prompt_schema.canonical_table_name(&table).is_none() {
                continue;
            }
            let hints = prompt_schema.derived_hints.entry(table).or_default();
            if !hints
                .iter()
                .any(|h| h.concept == hint.concept && h.expression == hint.expression)
            {
                hints.push(hint);
            }
        }

        let skills_ref = ticket.skills.as_ref().expect("skills set above");
        let outcome = self
            .core
            .synthesizer
            .synthesize(&SynthContext {
                user_text: &ticket.request.text,
                enhanced_intent: ticket
                    .routing
                    .as_ref()
                    .and_then(|r| r.enhanced_intent.as_deref()),
                skills: skills_ref,
                schema: &prompt_schema,
                schema_fingerprint: &snapshot.fingerprint(),
                dialect: ticket.database_kind,
                role: &ticket.owner_role,
                history: &ticket.request.history,
                scope_constraints,
                bypass_fingerprint: ticket.repair_count > 0 || ticket.pivot_count > 0,
                cancel,
            })
            .await;

        match outcome {
            Ok(SynthOutcome::Sql {
                sql,
                metadata,
                warnings,
                cost_optimized,
            }) => {
                ticket.sql = Some(sql);
                ticket.llm_metadata = metadata;
                ticket.warnings.extend(warnings);
                ticket.cost_optimized = ticket.cost_optimized || cost_optimized;
                ticket.next_action = NextAction::Validate;
            }
            Ok(SynthOutcome::Clarification(mut clarification)) => {
                if let Some(assessment) = &ticket.sentiment {
                    clarification.message = crate::sentiment::simplify_clarification(
                        &clarification.message,
                        assessment,
                    );
                }
                ticket.clarification = Some(clarification);
                ticket.disposition = Some(Disposition::ClarificationNeeded);
                ticket.next_action = NextAction::Done;
            }
            Err(ParleQLError::Cancelled { .. }) => {
                ticket.disposition = Some(Disposition::Cancelled);
                ticket.next_action = NextAction::Done;
            }
            Err(ParleQLError::InvalidIdentifiers { identifiers }) => {
                // The snapshot may be stale; drop it so the next attempt
                // refetches before resolving columns again.
                if let Err(e) = self.core.schema.invalidate(Some(ticket.database_kind)).await {
                    debug!(error = %e, "schema invalidation failed");
                }
                // Hard stop: route to clarification naming the offenders.
                let mut message = format!(
                    "The generated query referenced names not present in the schema: {}. \
                     Could you point me at the right columns?",
                    identifiers.join(", ")
                );
                if let Some(assessment) = &ticket.sentiment {
                    message = crate::sentiment::simplify_clarification(&message, assessment);
                }
                ticket.clarification = Some(ClarificationRequest {
                    message,
                    referenced_tables: Vec::new(),
                    unmapped_concepts: identifiers,
                });
                ticket.disposition = Some(Disposition::ClarificationNeeded);
                ticket.next_action = NextAction::Done;
            }
            Err(e) => {
                ticket.llm_metadata.error_details = Some(crate::types::ErrorDetails {
                    message: e.to_string(),
                    failed_at: "synthesize".to_string(),
                    sql_attempted: ticket.sql.as_ref().map(|s| s.text.clone()),
                    error_taxonomy: e.error_code().to_string(),
                });
                ticket.fail(e.error_code(), e.to_string());
            }
        }
    }

    async fn node_validate(
        &self,
        ticket: &mut QueryTicket,
        schema: &mut Option<Arc<SchemaSnapshot>>,
        cancel: &CancellationToken,
    ) {
        let _ = cancel;
        ticket.iteration_count += 1;
        if ticket.iteration_count >= self.core.config.max_iterations {
            ticket.fail(
                "iteration_limit",
                format!(
                    "validation entered {} times (limit {})",
                    ticket.iteration_count, self.core.config.max_iterations
                ),
            );
            return;
        }

        let snapshot = match self.ensure_schema(ticket.database_kind, schema).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                ticket.fail("schema_unavailable", e.to_string());
                return;
            }
        };
        let Some(sql) = ticket.sql.as_ref().map(|s| s.text.clone()) else {
            ticket.fail("validation_sql_rejected", "no SQL to validate");
            return;
        };

        let probe_driver = self.core.executor.driver_for(ticket.database_kind);
        let verdict = self
            .core
            .validator
            .validate(&ValidateContext {
                sql: &sql,
                dialect: ticket.database_kind,
                schema: &snapshot,
                user: &ticket.owner_user,
                role: &ticket.owner_role,
                auto_approve: ticket.auto_approve,
                probe_driver: probe_driver.as_ref(),
                repair_attempted: ticket.repair_count > 0,
            })
            .await;

        if verdict.needs_repair {
            ticket.repair_count += 1;
            ticket.next_action = NextAction::Repair;
            return;
        }
        if !verdict.valid {
            let kind = verdict
                .error_kind
                .clone()
                .unwrap_or_else(|| "validation_sql_rejected".to_string());
            let message = verdict.errors.join("; ");
            ticket.llm_metadata.error_details = Some(crate::types::ErrorDetails {
                message: message.clone(),
                failed_at: "validate".to_string(),
                sql_attempted: Some(sql),
                error_taxonomy: kind.clone(),
            });
            ticket.verdict = Some(verdict);
            ticket.fail(&kind, message);
            return;
        }

        ticket.warnings.extend(verdict.warnings.clone());
        let mut requires_approval = verdict.requires_approval && !ticket.approved;
        // Frustrated users get the default-on approval friction waived.
        // Forced approvals always carry a risk reason, so this can never
        // relax one.
        if requires_approval
            && verdict.risk_reasons.is_empty()
            && ticket
                .sentiment
                .as_ref()
                .is_some_and(|s| s.is_frustrated)
        {
            requires_approval = false;
            ticket
                .warnings
                .push("approval step waived to reduce friction".to_string());
        }
        self.core.events.publish(
            &ticket.id,
            QueryState::Prepared,
            json!({
                "sql": verdict.final_sql,
                "risk_level": verdict.risk_level,
                "requires_approval": requires_approval,
            }),
        );
        ticket.verdict = Some(verdict);
        ticket.next_action = if requires_approval {
            NextAction::AwaitApproval
        } else {
            NextAction::Execute
        };
    }

    async fn node_execute(&self, ticket: &mut QueryTicket, cancel: &CancellationToken) {
        self.core
            .events
            .publish(&ticket.id, QueryState::Executing, json!({}));
        let Some(sql) = ticket.effective_sql().map(ToString::to_string) else {
            ticket.fail("execution_error", "no SQL to execute");
            return;
        };

        match self
            .core
            .executor
            .execute(&sql, ticket.database_kind, &ticket.id, cancel)
            .await
        {
            Ok(result) => {
                ticket.result = Some(result);
                ticket.next_action = NextAction::Analyze;
            }
            Err(ParleQLError::Cancelled { .. }) => {
                ticket.disposition = Some(Disposition::Cancelled);
                ticket.next_action = NextAction::Done;
            }
            Err(e @ ParleQLError::ExecutionError { .. })
                if ticket.pivot_count < self.core.config.max_pivots =>
            {
                info!(error = %e, pivot = ticket.pivot_count + 1, "execution failed; pivoting");
                ticket.warnings.push(format!("execution attempt failed: {e}"));
                ticket.pivot_count += 1;
                ticket.next_action = NextAction::Pivot;
            }
            Err(e) => {
                ticket.llm_metadata.error_details = Some(crate::types::ErrorDetails {
                    message: e.to_string(),
                    failed_at: "execute".to_string(),
                    sql_attempted: Some(sql),
                    error_taxonomy: e.error_code().to_string(),
                });
                ticket.fail(e.error_code(), e.to_string());
            }
        }
    }

    fn node_analyze(ticket: &mut QueryTicket) {
        if let Some(result) = &mut ticket.result {
            result.data_quality = Some(analyze::data_quality_for(result));
            ticket.visualization = Some(analyze::visualization_for(result));
        }
        ticket.disposition = Some(Disposition::Success);
        ticket.next_action = NextAction::Done;
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    /// Terminal housekeeping: feed the outcome into the sentiment
    /// profile and mine successful runs for reusable skills. Never
    /// fails the ticket.
    async fn finalize(&self, ticket: &QueryTicket) {
        let success = matches!(ticket.disposition, Some(Disposition::Success));
        // Replies, cancellations, and rejections teach nothing about
        // query quality; data outcomes feed the failure streak.
        if !matches!(
            ticket.disposition,
            Some(Disposition::Reply | Disposition::Cancelled | Disposition::Rejected)
        ) {
            let response_time_ms = ticket.result.as_ref().map_or(0, |r| r.execution_time_ms);
            self.core
                .sentiment
                .record_outcome(&ticket.owner_user, success, response_time_ms)
                .await;
        }

        if success {
            if let (Some(skills_out), Some(sql)) = (&ticket.skills, ticket.effective_sql()) {
                if let Some(pattern) = skills::generation::extract(
                    &ticket.request.text,
                    sql,
                    &skills_out.mappings,
                    ticket.database_kind,
                ) {
                    self.core.skill_generator.record(&pattern).await;
                    let promoted = self.core.skill_generator.promote_due().await;
                    if !promoted.is_empty() {
                        info!(count = promoted.len(), "skills generated from query patterns");
                    }
                }
            }
        }
    }

    async fn ensure_schema(
        &self,
        kind: DatabaseKind,
        schema: &mut Option<Arc<SchemaSnapshot>>,
    ) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = schema {
            return Ok(Arc::clone(snapshot));
        }
        let driver = self
            .core
            .executor
            .driver_for(kind)
            .ok_or_else(|| ParleQLError::not_found("connection", kind.as_str()))?;
        let snapshot = self.core.schema.snapshot(kind, &driver).await?;
        *schema = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn publish_terminal(&self, ticket: &QueryTicket) {
        match ticket.disposition {
            Some(Disposition::Success) => self.core.events.publish(
                &ticket.id,
                QueryState::Finished,
                json!({
                    "row_count": ticket.result.as_ref().map_or(0, |r| r.row_count),
                    "execution_time_ms": ticket
                        .result
                        .as_ref()
                        .map_or(0, |r| r.execution_time_ms),
                }),
            ),
            Some(Disposition::Reply) => self.core.events.publish(
                &ticket.id,
                QueryState::Finished,
                json!({"reply": ticket.reply}),
            ),
            Some(Disposition::ClarificationNeeded) => self.core.events.publish(
                &ticket.id,
                QueryState::Error,
                json!({
                    "message": ticket
                        .clarification
                        .as_ref()
                        .map(|c| c.message.clone())
                        .unwrap_or_default(),
                    "clarification_details": ticket.clarification,
                }),
            ),
            Some(Disposition::Rejected) => {
                self.core
                    .events
                    .publish(&ticket.id, QueryState::Rejected, json!({}));
            }
            Some(Disposition::Cancelled) => {
                self.core
                    .events
                    .publish(&ticket.id, QueryState::Cancelled, json!({}));
            }
            Some(Disposition::Error) | None => self.core.events.publish(
                &ticket.id,
                QueryState::Error,
                json!({
                    "message": ticket.error.clone().unwrap_or_else(|| "internal error".to_string()),
                    "error_taxonomy": ticket.error_kind,
                }),
            ),
            Some(Disposition::PendingApproval) => {}
        }
    }

    /// Checkpoint with bounded retries and jittered backoff.
    async fn checkpoint(&self, ticket: &QueryTicket) -> Result<()> {
        let state = ticket.to_checkpoint()?;
        let mut last_error = None;
        for attempt in 0..CHECKPOINT_ATTEMPTS {
            match self.core.checkpointer.put(&ticket.id, &state).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "checkpoint write failed");
                    last_error = Some(e);
                    let jitter = rand::thread_rng().gen_range(0..25);
                    tokio::time::sleep(Duration::from_millis(50 * 2_u64.pow(attempt) + jitter))
                        .await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ParleQLError::internal("checkpoint write failed")))
    }
}

fn approved_tables(ticket: &QueryTicket) -> Vec<String> {
    ticket
        .verdict
        .as_ref()
        .map(|v| {
            // The scope counts don't keep names; recover them from the
            // effective SQL so adaptive HITL keys on the real table set.
            crate::validate::structure::analyze(&v.final_sql, ticket.database_kind)
                .map(|r| r.tables)
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

fn disposition_name(ticket: &QueryTicket) -> &'static str {
    match ticket.disposition {
        Some(Disposition::Success) => "success",
        Some(Disposition::Reply) => "success",
        Some(Disposition::PendingApproval) => "pending_approval",
        Some(Disposition::ClarificationNeeded) => "clarification_needed",
        Some(Disposition::Error) => "error",
        Some(Disposition::Rejected) => "rejected",
        Some(Disposition::Cancelled) => "cancelled",
        None => {
            if ticket.next_action == NextAction::AwaitApproval {
                "pending_approval"
            } else {
                "running"
            }
        }
    }
}
