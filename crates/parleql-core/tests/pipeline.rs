//! End-to-end pipeline scenarios over the composition root with
//! in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use parleql_core::cost::CostLevel;
use parleql_core::dialect::DatabaseKind;
use parleql_core::driver::DatabaseDriver;
use parleql_core::orchestrator::{ApprovalDecision, Disposition, SubmitParams};
use parleql_core::skills::MappingKind;
use parleql_core::types::{CacheStatus, ChatTurn, QueryState};
use parleql_core::{Core, CoreConfig, ParleQLError};
use parleql_test_utils::{
    orders_core, orders_driver, orders_result, FixedCostEstimator, ScriptedDriver, ScriptedLlm,
};

fn params(text: &str, database: DatabaseKind, auto_approve: Option<bool>) -> SubmitParams {
    SubmitParams {
        user: "alice".to_string(),
        role: "analyst".to_string(),
        session_id: "s1".to_string(),
        ip: "10.0.0.1".to_string(),
        user_agent: "tests".to_string(),
        database,
        auto_approve,
        text: text.to_string(),
        history: Vec::new(),
    }
}

/// Drain a ticket's full event history. Only call after the stream is
/// terminal.
async fn drain_states(core: &Core, ticket_id: &str) -> Vec<QueryState> {
    let mut subscription = core.events.subscribe(ticket_id).expect("subscription");
    let mut states = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), subscription.next()).await {
            Ok(Some(record)) => states.push(record.state),
            Ok(None) => break,
            Err(_) => panic!("stream did not terminate; saw {states:?}"),
        }
    }
    states
}

fn assert_stream_invariants(states: &[QueryState]) {
    assert_eq!(states.first(), Some(&QueryState::Received), "stream starts with received");
    let pending = states
        .iter()
        .filter(|s| **s == QueryState::PendingApproval)
        .count();
    assert!(pending <= 1, "at most one pending_approval: {states:?}");
    let terminals = states.iter().filter(|s| s.is_terminal()).count();
    assert_eq!(terminals, 1, "exactly one terminal frame: {states:?}");
    assert!(states.last().is_some_and(|s| s.is_terminal()));
}

// ============================================================================
// Scenario 1: simple aggregate, auto-approve
// ============================================================================

#[tokio::test]
async fn simple_aggregate_auto_approve() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total_sales FROM orders \
         WHERE EXTRACT(YEAR FROM order_date) = 2024 \
         GROUP BY region ORDER BY total_sales DESC",
        90,
    );
    let (core, driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params(
            "Total sales by region for 2024",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");

    assert_eq!(outcome.disposition(), Disposition::Success);
    let ticket = outcome.ticket;
    let executed = driver.executed_sql();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("SUM"));
    assert!(executed[0].contains("GROUP BY"));
    // Role row limit appended with the Postgres clause.
    assert!(executed[0].ends_with("LIMIT 1000"), "sql: {}", executed[0]);

    let result = ticket.result.as_ref().expect("result");
    assert_eq!(result.row_count, result.rows.len());
    assert!(ticket.visualization.is_some());

    let states = drain_states(&core, &ticket.id).await;
    assert_stream_invariants(&states);
    assert_eq!(
        states,
        vec![
            QueryState::Received,
            QueryState::Planning,
            QueryState::Prepared,
            QueryState::Executing,
            QueryState::Finished,
        ]
    );
}

// ============================================================================
// Scenario 2: derived temporal concept on Oracle
// ============================================================================

#[tokio::test]
async fn quarterly_revenue_on_oracle_uses_derived_expression() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT TO_CHAR(ORDERS.ORDER_DATE, 'Q') AS qtr, SUM(ORDERS.REVENUE) AS total_revenue \
         FROM ORDERS GROUP BY TO_CHAR(ORDERS.ORDER_DATE, 'Q')",
        88,
    );
    let driver = Arc::new(orders_driver(DatabaseKind::Oracle));
    let core = Core::builder(CoreConfig::default()).llm(Arc::new(llm)).build();
    core.executor.register_backend(
        DatabaseKind::Oracle,
        Arc::clone(&driver) as Arc<dyn DatabaseDriver>,
        None,
    );

    let outcome = core
        .orchestrator()
        .submit(params(
            "show quarterly revenue",
            DatabaseKind::Oracle,
            Some(true),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::Success);

    let ticket = outcome.ticket;
    let skills = ticket.skills.as_ref().expect("skills output");
    let quarter = skills
        .mappings
        .iter()
        .find(|m| m.concept == "quarter")
        .expect("quarter mapping");
    assert_eq!(quarter.kind, MappingKind::Derived);
    assert_eq!(quarter.expression, "TO_CHAR(ORDERS.ORDER_DATE, 'Q')");
    assert_eq!(quarter.confidence, 95);

    let executed = driver.executed_sql();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("TO_CHAR"));
    // Oracle row limiting.
    assert!(
        executed[0].ends_with("FETCH FIRST 1000 ROWS ONLY"),
        "sql: {}",
        executed[0]
    );
}

// ============================================================================
// Scenario 3: clarification needed
// ============================================================================

#[tokio::test]
async fn unmapped_concept_requests_clarification_without_sql() {
    let llm = ScriptedLlm::new();
    let (core, driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params(
            "show sales_amount by cohort from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");

    assert_eq!(outcome.disposition(), Disposition::ClarificationNeeded);
    let ticket = outcome.ticket;
    let clarification = ticket.clarification.as_ref().expect("clarification");
    assert!(clarification.unmapped_concepts.contains(&"cohort".to_string()));
    assert!(clarification.message.contains("cohort"));
    // Columns of the referenced table are offered back to the user.
    assert!(clarification.message.to_lowercase().contains("region"));

    // No SQL was executed and no LLM money was spent.
    assert!(driver.executed_sql().is_empty());

    let states = drain_states(&core, &ticket.id).await;
    assert_stream_invariants(&states);
    assert_eq!(states.last(), Some(&QueryState::Error));
}

#[tokio::test]
async fn clarify_resumes_on_the_same_thread() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total FROM orders GROUP BY region",
        85,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    let first = core
        .orchestrator()
        .submit(params(
            "show sales_amount by cohort from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(first.disposition(), Disposition::ClarificationNeeded);
    let id = first.ticket.id.clone();

    let second = core
        .orchestrator()
        .clarify(&id, "use region for cohort", None)
        .await
        .expect("clarified run");
    assert_eq!(second.ticket.id, id, "thread id is reused");
    assert_eq!(second.disposition(), Disposition::Success);
    // Prior turn is preserved as conversation history.
    assert!(!second.ticket.request.history.is_empty());
}

// ============================================================================
// Scenario 4: injection blocked before the LLM
// ============================================================================

#[tokio::test]
async fn stacked_query_input_is_blocked_pre_llm() {
    let llm = ScriptedLlm::new();
    let (core, driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params(
            "show me total sales; DROP TABLE users",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");

    assert_eq!(outcome.disposition(), Disposition::Error);
    let ticket = outcome.ticket;
    assert_eq!(ticket.error_kind.as_deref(), Some("injection_blocked"));
    assert!(driver.executed_sql().is_empty());

    let states = drain_states(&core, &ticket.id).await;
    assert_eq!(states, vec![QueryState::Received, QueryState::Error]);
}

// ============================================================================
// Scenario 5: approval flow with modification, duplicate decision
// ============================================================================

fn sensitive_core(llm: ScriptedLlm) -> (Arc<Core>, Arc<ScriptedDriver>) {
    let mut config = CoreConfig::default();
    config
        .sensitive_tables
        .push("SENSITIVE_USERS".to_string());
    let driver = Arc::new(
        ScriptedDriver::new(DatabaseKind::Postgres).with_table(
            "sensitive_users",
            &[
                ("email", "character varying(128)", false),
                ("region", "character varying(64)", true),
            ],
        ),
    );
    let core = Core::builder(config).llm(Arc::new(llm)).build();
    core.executor.register_backend(
        DatabaseKind::Postgres,
        Arc::clone(&driver) as Arc<dyn DatabaseDriver>,
        None,
    );
    (Arc::new(core), driver)
}

#[tokio::test]
async fn sensitive_table_pauses_for_approval_and_accepts_modified_sql() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, email FROM sensitive_users",
        92,
    );
    let (core, driver) = sensitive_core(llm);

    let outcome = core
        .orchestrator()
        .submit(params(
            "show email by region from sensitive_users",
            DatabaseKind::Postgres,
            Some(false),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::PendingApproval);
    let id = outcome.ticket.id.clone();
    let verdict = outcome.ticket.verdict.as_ref().expect("verdict");
    assert!(verdict
        .risk_reasons
        .iter()
        .any(|r| r.contains("sensitive table")));
    assert!(driver.executed_sql().is_empty(), "nothing ran before approval");

    let approved = core
        .orchestrator()
        .approve(
            &id,
            ApprovalDecision {
                approved: true,
                modified_sql: Some("SELECT COUNT(*) FROM sensitive_users".to_string()),
                rejection_reason: None,
            },
        )
        .await
        .expect("approval resumes");
    assert_eq!(approved.disposition(), Disposition::Success);
    let executed = driver.executed_sql();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("COUNT(*)"));

    // A second decision on the same ticket is a duplicate.
    let duplicate = core
        .orchestrator()
        .approve(
            &id,
            ApprovalDecision {
                approved: true,
                modified_sql: None,
                rejection_reason: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(duplicate, ParleQLError::ApprovalDuplicate { .. }));

    let states = drain_states(&core, &id).await;
    assert_stream_invariants(&states);
    assert!(states.contains(&QueryState::PendingApproval));
    assert!(states.contains(&QueryState::Approved));
    assert_eq!(states.last(), Some(&QueryState::Finished));
}

#[tokio::test]
async fn rejection_terminates_with_a_rejected_frame() {
    let llm = ScriptedLlm::new().reply_sql("SELECT email FROM sensitive_users", 92);
    let (core, _driver) = sensitive_core(llm);

    let outcome = core
        .orchestrator()
        .submit(params(
            "show email from sensitive_users",
            DatabaseKind::Postgres,
            Some(false),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::PendingApproval);
    let id = outcome.ticket.id.clone();

    let rejected = core
        .orchestrator()
        .approve(
            &id,
            ApprovalDecision {
                approved: false,
                modified_sql: None,
                rejection_reason: Some("too broad".to_string()),
            },
        )
        .await
        .expect("rejection runs");
    assert_eq!(rejected.disposition(), Disposition::Rejected);

    let states = drain_states(&core, &id).await;
    assert_stream_invariants(&states);
    assert_eq!(states.last(), Some(&QueryState::Rejected));
}

// ============================================================================
// Scenario 6: cost-based re-optimization
// ============================================================================

#[tokio::test]
async fn high_cost_sql_is_rewritten_before_execution() {
    let llm = ScriptedLlm::new()
        .reply_sql("SELECT region, sales_amount FROM orders", 90)
        .reply(
            "SELECT region, sales_amount FROM orders \
             WHERE order_date > CURRENT_DATE",
        );
    let cost = FixedCostEstimator::new()
        .with_estimate(FixedCostEstimator::estimate(CostLevel::High, 500, true))
        .with_estimate(FixedCostEstimator::estimate(CostLevel::Medium, 400, false));
    let driver = Arc::new(orders_driver(DatabaseKind::Postgres).with_result(orders_result()));
    let core = Core::builder(CoreConfig::default())
        .llm(Arc::new(llm))
        .cost_estimator(Arc::new(cost))
        .build();
    core.executor.register_backend(
        DatabaseKind::Postgres,
        Arc::clone(&driver) as Arc<dyn DatabaseDriver>,
        None,
    );

    let outcome = core
        .orchestrator()
        .submit(params(
            "show sales_amount by region from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");

    assert_eq!(outcome.disposition(), Disposition::Success);
    assert!(outcome.ticket.cost_optimized, "rewrite flagged");
    let executed = driver.executed_sql();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("WHERE order_date > CURRENT_DATE"));
}

// ============================================================================
// Fingerprint cache
// ============================================================================

#[tokio::test]
async fn repeat_question_skips_the_llm() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total FROM orders GROUP BY region",
        85,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    let first = core
        .orchestrator()
        .submit(params(
            "total sales by region from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("first run");
    assert_eq!(first.disposition(), Disposition::Success);
    assert!(!first.ticket.sql.as_ref().expect("sql").was_cached);

    // Same question, different whitespace/casing: fingerprint hit, no
    // scripted reply left and none needed.
    let second = core
        .orchestrator()
        .submit(params(
            "Total  Sales by Region from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("second run");
    assert_eq!(second.disposition(), Disposition::Success);
    let sql = second.ticket.sql.as_ref().expect("sql");
    assert!(sql.was_cached);
    assert!(second.ticket.llm_metadata.was_cached);
}

// ============================================================================
// Conversational / metadata routing
// ============================================================================

#[tokio::test]
async fn greetings_short_circuit_without_sql() {
    let llm = ScriptedLlm::new();
    let (core, driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params("hello there", DatabaseKind::Postgres, None))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::Reply);
    assert!(outcome.ticket.reply.is_some());
    assert!(driver.executed_sql().is_empty());
}

#[tokio::test]
async fn metadata_questions_answer_from_the_schema() {
    let llm = ScriptedLlm::new();
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params(
            "what tables do you have?",
            DatabaseKind::Postgres,
            None,
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::Reply);
    assert!(outcome.ticket.reply.expect("reply").contains("orders"));
}

// ============================================================================
// Iteration cap and cancellation
// ============================================================================

#[tokio::test]
async fn iteration_cap_stops_the_machine() {
    let llm = ScriptedLlm::new().reply_sql("SELECT region FROM orders", 90);
    let mut config = CoreConfig::default();
    config.max_iterations = 1;
    let (core, _driver) = orders_core(llm, config);

    let outcome = core
        .orchestrator()
        .submit(params(
            "show region from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::Error);
    assert_eq!(outcome.ticket.error_kind.as_deref(), Some("iteration_limit"));
}

#[tokio::test]
async fn cancel_of_pending_ticket_publishes_terminal_frame() {
    let llm = ScriptedLlm::new().reply_sql("SELECT email FROM sensitive_users", 92);
    let (core, _driver) = sensitive_core(llm);

    let outcome = core
        .orchestrator()
        .submit(params(
            "show email from sensitive_users",
            DatabaseKind::Postgres,
            Some(false),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::PendingApproval);
    let id = outcome.ticket.id.clone();

    assert!(core.orchestrator().cancel(&id).await.expect("cancel"));
    let states = drain_states(&core, &id).await;
    assert_eq!(states.last(), Some(&QueryState::Cancelled));

    // Cancelling an unknown ticket reports not-found.
    assert!(!core
        .orchestrator()
        .cancel("q_unknown_ticket_1")
        .await
        .expect("cancel"));
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn history_lists_own_tickets_only() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region FROM orders",
        90,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    let mine = core
        .orchestrator()
        .submit(params("show region from orders", DatabaseKind::Postgres, Some(true)))
        .await
        .expect("runs");
    assert_eq!(mine.disposition(), Disposition::Success);

    let theirs = SubmitParams {
        user: "bob".to_string(),
        ..params("hello", DatabaseKind::Postgres, None)
    };
    core.orchestrator().submit(theirs).await.expect("runs");

    let history = core
        .orchestrator()
        .history("alice", 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].query_id, mine.ticket.id);
    assert_eq!(history[0].status, "success");
}

// ============================================================================
// Sentiment adaptation
// ============================================================================

#[tokio::test]
async fn frustrated_user_gets_a_simplified_clarification() {
    let llm = ScriptedLlm::new();
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    let outcome = core
        .orchestrator()
        .submit(params(
            "useless! show sales_amount by cohort from orders",
            DatabaseKind::Postgres,
            Some(true),
        ))
        .await
        .expect("pipeline runs");

    assert_eq!(outcome.disposition(), Disposition::ClarificationNeeded);
    let ticket = outcome.ticket;
    let assessment = ticket.sentiment.as_ref().expect("assessment");
    assert!(assessment.is_frustrated);
    let clarification = ticket.clarification.as_ref().expect("clarification");
    assert!(clarification
        .message
        .starts_with("Let's take this one step at a time."));
    assert!(clarification.message.contains("cohort"));
}

#[tokio::test]
async fn frustration_waives_default_approval_friction_but_not_forced() {
    // Default-on friction (auto_approve = false, no risk reasons) is
    // waived for a frustrated user.
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, sales_amount FROM orders WHERE sales_amount > 0",
        90,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());
    let outcome = core
        .orchestrator()
        .submit(params(
            "useless! show sales_amount by region from orders",
            DatabaseKind::Postgres,
            Some(false),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::Success);
    assert!(outcome
        .ticket
        .warnings
        .iter()
        .any(|w| w.contains("approval step waived")));

    // A forced approval (sensitive table) is never waived, frustrated
    // or not.
    let llm = ScriptedLlm::new().reply_sql("SELECT email FROM sensitive_users", 92);
    let (core, _driver) = sensitive_core(llm);
    let outcome = core
        .orchestrator()
        .submit(params(
            "useless! show email from sensitive_users",
            DatabaseKind::Postgres,
            Some(false),
        ))
        .await
        .expect("pipeline runs");
    assert_eq!(outcome.disposition(), Disposition::PendingApproval);
}

// ============================================================================
// Skill generation
// ============================================================================

#[tokio::test]
async fn recurring_successful_pattern_becomes_a_learned_skill() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total FROM orders GROUP BY region",
        90,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());

    for _ in 0..3 {
        let outcome = core
            .orchestrator()
            .submit(params(
                "total sales by region from orders",
                DatabaseKind::Postgres,
                Some(true),
            ))
            .await
            .expect("pipeline runs");
        assert_eq!(outcome.disposition(), Disposition::Success);
    }

    let hints = core.skill_generator.learned_hints().await;
    assert!(
        hints.iter().any(|(table, hint)| {
            table == "orders" && hint.concept == "sales" && hint.expression.contains("sales_amount")
        }),
        "hints: {hints:?}"
    );
}

#[tokio::test]
async fn failed_queries_do_not_feed_skill_generation() {
    // Only a clarification comes out of this run; nothing executes, so
    // no pattern should be mined.
    let llm = ScriptedLlm::new();
    let (core, _driver) = orders_core(llm, CoreConfig::default());
    for _ in 0..3 {
        let outcome = core
            .orchestrator()
            .submit(params(
                "show sales_amount by cohort from orders",
                DatabaseKind::Postgres,
                Some(true),
            ))
            .await
            .expect("pipeline runs");
        assert_eq!(outcome.disposition(), Disposition::ClarificationNeeded);
    }
    assert!(core.skill_generator.learned_hints().await.is_empty());
}

// ============================================================================
// Conversation history plumbing
// ============================================================================

#[tokio::test]
async fn history_turns_ride_into_the_prompt() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total FROM orders GROUP BY region",
        85,
    );
    let (core, _driver) = orders_core(llm, CoreConfig::default());
    let mut p = params("total sales by region from orders", DatabaseKind::Postgres, Some(true));
    p.history = vec![ChatTurn {
        role: parleql_core::types::ChatRole::User,
        content: "we looked at orders yesterday".to_string(),
    }];
    let outcome = core.orchestrator().submit(p).await.expect("runs");
    assert_eq!(outcome.disposition(), Disposition::Success);
    assert_eq!(
        outcome.ticket.result.as_ref().map(|r| r.cache_status),
        Some(CacheStatus::Fresh)
    );
}
