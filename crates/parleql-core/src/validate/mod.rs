//! The validator and safety net.
//!
//! A pipeline of ten checks in fixed order: injection scan, structural
//! validity, dialect validation, scope limits, sensitive-table
//! detection, cartesian-join guard, row-limit + quota enforcement,
//! row-level security, cost estimation, and the approval-gate decision.
//! Any check may record an error (terminal), a warning (continue), a
//! risk escalation (force approval), or rewrite the SQL (row limit,
//! RLS).

pub mod injection;
pub mod row_limit;
pub mod structure;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::cost::{CostEstimate, CostEstimator, CostLevel};
use crate::dialect::DatabaseKind;
use crate::driver::DatabaseDriver;
use crate::kv::KvStore;
use crate::rls::RlsService;
use crate::schema::SchemaSnapshot;

pub use injection::{DetectionResult, InjectionFinding, Severity};
pub use structure::{QueryKind, StructureReport};

/// Injection risk score at which approval is forced.
const RISK_ESCALATION_SCORE: u8 = 30;
/// Expected cardinality above which approval is forced without
/// auto-approve.
const CARDINALITY_APPROVAL_THRESHOLD: u64 = 1000;

/// Overall risk classification of a validated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Nothing of note.
    Safe,
    /// Minor findings.
    Low,
    /// Escalation-worthy findings.
    Medium,
    /// Blocking-severity findings present.
    High,
    /// Hostile input.
    Critical,
}

/// Table/join counts against the role's limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeInfo {
    /// Distinct tables referenced.
    pub table_count: usize,
    /// JOINs (explicit plus comma pairs).
    pub join_count: usize,
    /// Role limit on tables (after risk tightening).
    pub max_tables: usize,
    /// Role limit on joins (after risk tightening).
    pub max_joins: usize,
    /// Role the limits came from.
    pub role: String,
}

/// Validator output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Whether the SQL may proceed (to execution or approval).
    pub valid: bool,
    /// Overall risk classification.
    pub risk_level: RiskLevel,
    /// Statement classification.
    pub query_kind: QueryKind,
    /// Whether the approval gate stands between this SQL and execution.
    pub requires_approval: bool,
    /// Non-fatal findings, ordered.
    pub warnings: Vec<String>,
    /// Fatal findings, ordered.
    pub errors: Vec<String>,
    /// Scope counts and limits.
    pub scope_info: ScopeInfo,
    /// Injection findings.
    pub injection_findings: Vec<InjectionFinding>,
    /// Cost estimate, when the estimator was reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,
    /// Why approval was forced, in the user's terms.
    pub risk_reasons: Vec<String>,
    /// The SQL after rewrites (row limit, RLS). Execute this, not the
    /// input.
    pub final_sql: String,
    /// Whether RLS rewrote the SQL.
    pub rls_applied: bool,
    /// Route once through the repair branch before giving up.
    pub needs_repair: bool,
    /// Stable error kind when `valid` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Per-call context.
pub struct ValidateContext<'a> {
    /// SQL to validate.
    pub sql: &'a str,
    /// Target dialect.
    pub dialect: DatabaseKind,
    /// Schema the SQL must resolve against.
    pub schema: &'a SchemaSnapshot,
    /// Calling user.
    pub user: &'a str,
    /// Calling user's role.
    pub role: &'a str,
    /// Client auto-approve preference.
    pub auto_approve: bool,
    /// Driver for the optional Oracle structural probe.
    pub probe_driver: Option<&'a Arc<dyn DatabaseDriver>>,
    /// Whether the repair branch already ran for this ticket.
    pub repair_attempted: bool,
}

/// The validator.
pub struct Validator {
    cost: Arc<dyn CostEstimator>,
    rls: Arc<dyn RlsService>,
    kv: Arc<dyn KvStore>,
    config: CoreConfig,
}

impl Validator {
    /// Assemble from the composition root's collaborators.
    #[must_use]
    pub fn new(
        cost: Arc<dyn CostEstimator>,
        rls: Arc<dyn RlsService>,
        kv: Arc<dyn KvStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            cost,
            rls,
            kv,
            config,
        }
    }

    /// Run the full check pipeline.
    pub async fn validate(&self, ctx: &ValidateContext<'_>) -> ValidationVerdict {
        let is_admin = CoreConfig::is_admin_role(ctx.role);
        let limits = self.config.limits_for_role(ctx.role);
        let mut verdict = ValidationVerdict {
            valid: true,
            risk_level: RiskLevel::Safe,
            query_kind: QueryKind::Other,
            requires_approval: !ctx.auto_approve,
            warnings: Vec::new(),
            errors: Vec::new(),
            scope_info: ScopeInfo {
                table_count: 0,
                join_count: 0,
                max_tables: limits.max_tables,
                max_joins: limits.max_joins,
                role: ctx.role.to_string(),
            },
            injection_findings: Vec::new(),
            cost_estimate: None,
            risk_reasons: Vec::new(),
            final_sql: ctx.sql.to_string(),
            rls_applied: false,
            needs_repair: false,
            error_kind: None,
        };
        let mut force_approval = false;

        // 1. Injection scan.
        let detection = injection::scan_sql(ctx.sql);
        verdict.risk_level = risk_level_of(&detection);
        verdict.injection_findings = detection.findings.clone();
        if detection.has_blocking_finding() {
            let worst = detection
                .findings
                .iter()
                .max_by_key(|f| f.severity)
                .map(|f| f.kind.clone())
                .unwrap_or_else(|| "injection".to_string());
            verdict.valid = false;
            verdict.error_kind = Some("injection_blocked".to_string());
            verdict
                .errors
                .push(format!("blocked by injection scan: {worst}"));
            return verdict;
        }
        if detection.risk_score >= RISK_ESCALATION_SCORE {
            force_approval = true;
            verdict.risk_reasons.push(format!(
                "injection risk score {} requires review",
                detection.risk_score
            ));
        }

        // 2. Structural validity.
        let report = match structure::analyze(ctx.sql, ctx.dialect) {
            Ok(report) => report,
            Err(e) => {
                if ctx.repair_attempted {
                    verdict.valid = false;
                    verdict.error_kind = Some("validation_sql_rejected".to_string());
                    verdict.errors.push(e.to_string());
                } else {
                    debug!(error = %e, "structural check failed; routing to repair");
                    verdict.needs_repair = true;
                }
                return verdict;
            }
        };
        verdict.query_kind = report.query_kind;
        if report.query_kind != QueryKind::Select {
            verdict.valid = false;
            verdict.error_kind = Some("validation_sql_rejected".to_string());
            verdict
                .errors
                .push("only read-only SELECT statements are executed".to_string());
            return verdict;
        }
        if let Some(probe_error) = self.oracle_probe(ctx, &report).await {
            if ctx.repair_attempted {
                verdict.valid = false;
                verdict.error_kind = Some("validation_sql_rejected".to_string());
                verdict.errors.push(probe_error);
            } else {
                debug!(error = %probe_error, "probe failed; routing to repair");
                verdict.needs_repair = true;
            }
            return verdict;
        }
        // Every identifier must resolve against the schema. Synthesized
        // SQL already passed this; user-modified SQL enters here without
        // having been through the synthesizer.
        if let Err(e) = crate::synth::identifiers::validate(ctx.sql, ctx.schema, ctx.dialect) {
            verdict.valid = false;
            verdict.error_kind = Some("invalid_identifiers".to_string());
            verdict.errors.push(e.to_string());
            return verdict;
        }

        // 3. Dialect validation, with one auto-conversion.
        if let Err(parse_error) = crate::synth::convert::validate_dialect(&verdict.final_sql, ctx.dialect) {
            let from = if ctx.dialect == DatabaseKind::Oracle {
                DatabaseKind::Postgres
            } else {
                DatabaseKind::Oracle
            };
            match crate::synth::convert::convert(&verdict.final_sql, from, ctx.dialect) {
                Ok((converted, conversion_warnings)) => {
                    verdict.final_sql = converted;
                    verdict.warnings.extend(conversion_warnings);
                }
                Err(e) => {
                    verdict.valid = false;
                    verdict.error_kind = Some("dialect_conversion_failed".to_string());
                    verdict
                        .errors
                        .push(format!("SQL fails {} validation: {parse_error}; {e}", ctx.dialect));
                    return verdict;
                }
            }
        }

        // 4. Scope limits; high risk tightens by one.
        let (mut max_tables, mut max_joins) = (limits.max_tables, limits.max_joins);
        if verdict.risk_level >= RiskLevel::High {
            max_tables = max_tables.saturating_sub(1).max(1);
            max_joins = max_joins.saturating_sub(1).max(1);
        }
        verdict.scope_info = ScopeInfo {
            table_count: report.tables.len(),
            join_count: report.join_count,
            max_tables,
            max_joins,
            role: ctx.role.to_string(),
        };
        if report.tables.len() > max_tables {
            force_approval = true;
            verdict.risk_reasons.push(format!(
                "query touches {} tables (role limit {max_tables})",
                report.tables.len()
            ));
        }
        if report.join_count > max_joins {
            force_approval = true;
            verdict.risk_reasons.push(format!(
                "query uses {} joins (role limit {max_joins})",
                report.join_count
            ));
        }

        // 5. Sensitive tables.
        for table in &report.tables {
            if self
                .config
                .sensitive_tables
                .iter()
                .any(|s| s.eq_ignore_ascii_case(table))
            {
                force_approval = true;
                verdict
                    .risk_reasons
                    .push(format!("sensitive table {table}"));
            }
        }

        // 6. Cartesian-join guard.
        if report.has_cartesian_risk {
            force_approval = true;
            verdict
                .risk_reasons
                .push("join without a linking predicate (cartesian product risk)".to_string());
        }

        // 7. Row limit and daily quota.
        let role_cap = if is_admin { None } else { limits.max_rows };
        let (capped, changed) = row_limit::enforce(&verdict.final_sql, ctx.dialect, role_cap);
        if changed {
            verdict
                .warnings
                .push("row limit enforced for your role".to_string());
            verdict.final_sql = capped;
        }
        if let Some(quota) = limits.daily_query_quota {
            match self.bump_daily_quota(ctx.user).await {
                Some(used) if used > quota => {
                    verdict.valid = false;
                    verdict.error_kind = Some("quota_exceeded".to_string());
                    verdict
                        .errors
                        .push(format!("daily query quota exceeded ({used}/{quota})"));
                    return verdict;
                }
                Some(_) => {}
                None => verdict
                    .warnings
                    .push("quota store unreachable; quota not enforced".to_string()),
            }
        }

        // 8. Row-level security.
        match self
            .rls
            .enforce(&verdict.final_sql, ctx.user, ctx.role, &HashMap::new())
            .await
        {
            Ok(outcome) => {
                verdict.rls_applied = outcome.applied;
                if outcome.applied {
                    info!(reason = %outcome.reason, "RLS rewrote the query");
                    verdict.final_sql = outcome.modified_sql;
                    verdict.warnings.push(format!("row-level security applied: {}", outcome.reason));
                }
            }
            Err(e) => {
                // Fail closed: a broken policy engine must not widen access.
                verdict.valid = false;
                verdict.error_kind = Some("unauthorized".to_string());
                verdict
                    .errors
                    .push(format!("row-level security unavailable: {e}"));
                return verdict;
            }
        }

        // 9. Cost estimate.
        match self.cost.estimate(&verdict.final_sql, ctx.dialect, false).await {
            Ok(estimate) => {
                if estimate.level >= self.config.cost_level_blocking && !is_admin {
                    verdict.valid = false;
                    verdict.error_kind = Some("cost_blocked".to_string());
                    verdict.errors.push(format!(
                        "estimated cost is {}; narrow the query",
                        estimate.level.as_str()
                    ));
                    verdict
                        .errors
                        .extend(estimate.recommendations.iter().take(3).cloned());
                    verdict.cost_estimate = Some(estimate);
                    return verdict;
                }
                if estimate.level >= self.config.cost_level_requiring_approval {
                    force_approval = true;
                    verdict.risk_reasons.push(format!(
                        "estimated cost is {}",
                        estimate.level.as_str()
                    ));
                }
                if estimate.cardinality > CARDINALITY_APPROVAL_THRESHOLD && !ctx.auto_approve {
                    force_approval = true;
                    verdict.risk_reasons.push(format!(
                        "expected row count {} exceeds {}",
                        estimate.cardinality, CARDINALITY_APPROVAL_THRESHOLD
                    ));
                }
                if estimate.level == CostLevel::Critical && is_admin {
                    verdict
                        .warnings
                        .push("critical cost estimate allowed for admin".to_string());
                }
                verdict.cost_estimate = Some(estimate);
            }
            Err(e) => {
                warn!(error = %e, "cost estimator unreachable");
                verdict
                    .warnings
                    .push("cost estimate unavailable".to_string());
            }
        }

        // 10. Approval gate.
        verdict.requires_approval = !ctx.auto_approve;
        if force_approval {
            verdict.requires_approval = true;
        } else if verdict.requires_approval {
            // Adaptive HITL: a history of approved queries over the same
            // table set earns an automatic pass. Never overrides a forced
            // approval.
            if self.has_approval_history(ctx.user, &report.tables).await {
                verdict.requires_approval = false;
                verdict
                    .warnings
                    .push("approval waived based on prior approvals of similar queries".to_string());
            }
        }

        verdict
    }

    /// Record a human approval so adaptive HITL can learn from it.
    pub async fn record_approval(&self, user: &str, tables: &[String]) {
        let key = approval_history_key(user, tables);
        if let Err(e) = self.kv.incr(&key).await {
            warn!(error = %e, "approval history write failed");
        }
    }

    async fn has_approval_history(&self, user: &str, tables: &[String]) -> bool {
        let key = approval_history_key(user, tables);
        match self.kv.get(&key).await {
            Ok(Some(count)) => count.parse::<u64>().map_or(false, |n| n >= 3),
            _ => false,
        }
    }

    /// Increment and return today's query count for the user. `None` when
    /// the store is unreachable.
    async fn bump_daily_quota(&self, user: &str) -> Option<u64> {
        let key = format!("quota:{user}:{}", Utc::now().format("%Y%m%d"));
        match self.kv.incr(&key).await {
            Ok(count) => {
                if count == 1 {
                    let _ = self.kv.expire(&key, Duration::from_secs(24 * 3600)).await;
                }
                Some(count)
            }
            Err(e) => {
                warn!(error = %e, "quota increment failed");
                None
            }
        }
    }

    /// Oracle-only structural probe: wrap the query so the backend
    /// parses it without scanning data. Returns an error message on
    /// probe failure.
    async fn oracle_probe(
        &self,
        ctx: &ValidateContext<'_>,
        report: &StructureReport,
    ) -> Option<String> {
        if ctx.dialect != DatabaseKind::Oracle || !report.probe_amenable {
            return None;
        }
        let driver = ctx.probe_driver?;
        let probe = format!("SELECT 1 FROM ({}) WHERE ROWNUM < 1", ctx.sql.trim_end_matches(';'));
        match driver.execute(&probe, Duration::from_secs(10)).await {
            Ok(_) => None,
            Err(e) => Some(format!("structural probe failed: {e}")),
        }
    }
}

fn risk_level_of(detection: &DetectionResult) -> RiskLevel {
    let worst = detection.findings.iter().map(|f| f.severity).max();
    match worst {
        Some(Severity::Critical) => RiskLevel::Critical,
        Some(Severity::High) => RiskLevel::High,
        _ if detection.risk_score >= RISK_ESCALATION_SCORE => RiskLevel::Medium,
        Some(_) => RiskLevel::Low,
        None => RiskLevel::Safe,
    }
}

fn approval_history_key(user: &str, tables: &[String]) -> String {
    let mut sorted: Vec<String> = tables.iter().map(|t| t.to_ascii_uppercase()).collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(sorted.join(",").as_bytes());
    format!("hitl:{user}:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::HeuristicCostEstimator;
    use crate::kv::MemoryKv;
    use crate::rls::AllowAllRls;
    use crate::schema::ColumnInfo;
    use indexmap::IndexMap;

    fn schema() -> SchemaSnapshot {
        let mut tables = IndexMap::new();
        for name in ["ORDERS", "REGIONS", "T1", "T2", "T3", "T4", "T5", "SENSITIVE_USERS"] {
            tables.insert(
                name.to_string(),
                vec![ColumnInfo {
                    name: "ID".to_string(),
                    data_type: "NUMBER".to_string(),
                    nullable: false,
                    requires_quoting: false,
                }],
            );
        }
        SchemaSnapshot {
            tables,
            ..SchemaSnapshot::default()
        }
    }

    fn validator() -> Validator {
        let mut config = CoreConfig::default();
        config.sensitive_tables.push("SENSITIVE_USERS".to_string());
        Validator::new(
            Arc::new(HeuristicCostEstimator),
            Arc::new(AllowAllRls),
            Arc::new(MemoryKv::new()),
            config,
        )
    }

    fn ctx<'a>(sql: &'a str, schema: &'a SchemaSnapshot) -> ValidateContext<'a> {
        ValidateContext {
            sql,
            dialect: DatabaseKind::Postgres,
            schema,
            user: "alice",
            role: "analyst",
            auto_approve: true,
            probe_driver: None,
            repair_attempted: false,
        }
    }

    #[tokio::test]
    async fn clean_select_passes_with_row_limit() {
        let schema = schema();
        let verdict = validator()
            .validate(&ctx("SELECT id FROM orders WHERE id > 5", &schema))
            .await;
        assert!(verdict.valid, "errors: {:?}", verdict.errors);
        assert!(verdict.final_sql.ends_with("LIMIT 1000"));
        assert!(!verdict.requires_approval);
    }

    #[tokio::test]
    async fn injection_blocks_before_anything_else() {
        let schema = schema();
        let verdict = validator()
            .validate(&ctx("SELECT id FROM orders; DROP TABLE orders", &schema))
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.error_kind.as_deref(), Some("injection_blocked"));
        assert!(verdict.risk_level >= RiskLevel::High);
    }

    #[tokio::test]
    async fn dml_is_rejected() {
        let schema = schema();
        let verdict = validator()
            .validate(&ctx("DELETE FROM orders WHERE id = 1", &schema))
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.query_kind, QueryKind::Dml);
    }

    #[tokio::test]
    async fn table_limit_boundary() {
        let schema = schema();
        let validator = validator();
        // Four tables: exactly at the analyst limit.
        let at_limit = "SELECT t1.id FROM t1 \
                        JOIN t2 ON t1.id = t2.id \
                        JOIN t3 ON t1.id = t3.id \
                        WHERE t1.id IN (SELECT id FROM t4 WHERE id > 0) AND t1.id > 0";
        let verdict = validator.validate(&ctx(at_limit, &schema)).await;
        assert!(verdict.valid);
        assert!(
            !verdict.risk_reasons.iter().any(|r| r.contains("tables")),
            "reasons: {:?}",
            verdict.risk_reasons
        );

        // Five tables: one over.
        let over = "SELECT t1.id FROM t1 \
                    JOIN t2 ON t1.id = t2.id \
                    JOIN t3 ON t1.id = t3.id \
                    WHERE t1.id IN (SELECT id FROM t4 WHERE id > 0) \
                    AND t1.id IN (SELECT id FROM t5 WHERE id > 0)";
        let verdict = validator.validate(&ctx(over, &schema)).await;
        assert!(verdict.valid);
        assert!(verdict.requires_approval);
        assert!(verdict.risk_reasons.iter().any(|r| r.contains("tables")));
    }

    #[tokio::test]
    async fn sensitive_table_forces_approval() {
        let schema = schema();
        let verdict = validator()
            .validate(&ctx("SELECT id FROM sensitive_users WHERE id = 1", &schema))
            .await;
        assert!(verdict.valid);
        assert!(verdict.requires_approval);
        assert!(verdict
            .risk_reasons
            .iter()
            .any(|r| r.contains("sensitive table")));
    }

    #[tokio::test]
    async fn cartesian_join_forces_approval() {
        let schema = schema();
        let verdict = validator()
            .validate(&ctx("SELECT t1.id FROM t1 CROSS JOIN t2 WHERE t1.id > 0", &schema))
            .await;
        assert!(verdict.requires_approval);
        assert!(verdict
            .risk_reasons
            .iter()
            .any(|r| r.contains("cartesian")));
    }

    #[tokio::test]
    async fn quota_exhaustion_is_terminal() {
        let schema = schema();
        let mut config = CoreConfig::default();
        if let Some(limits) = config.role_limits.get_mut("analyst") {
            limits.daily_query_quota = Some(2);
        }
        let validator = Validator::new(
            Arc::new(HeuristicCostEstimator),
            Arc::new(AllowAllRls),
            Arc::new(MemoryKv::new()),
            config,
        );
        let sql = "SELECT id FROM orders WHERE id > 5";
        for _ in 0..2 {
            let verdict = validator.validate(&ctx(sql, &schema)).await;
            assert!(verdict.valid);
        }
        let verdict = validator.validate(&ctx(sql, &schema)).await;
        assert!(!verdict.valid);
        assert_eq!(verdict.error_kind.as_deref(), Some("quota_exceeded"));
    }

    #[tokio::test]
    async fn adaptive_hitl_waives_after_three_approvals() {
        let schema = schema();
        let validator = validator();
        let sql = "SELECT id FROM orders WHERE id > 5";
        let mut no_auto = ctx(sql, &schema);
        no_auto.auto_approve = false;
        let verdict = validator.validate(&no_auto).await;
        assert!(verdict.requires_approval);

        for _ in 0..3 {
            validator.record_approval("alice", &["ORDERS".to_string()]).await;
        }
        let verdict = validator.validate(&no_auto).await;
        assert!(!verdict.requires_approval);
    }

    #[tokio::test]
    async fn adaptive_hitl_never_overrides_force() {
        let schema = schema();
        let validator = validator();
        for _ in 0..5 {
            validator
                .record_approval("alice", &["SENSITIVE_USERS".to_string()])
                .await;
        }
        let mut context = ctx("SELECT id FROM sensitive_users WHERE id = 1", &schema);
        context.auto_approve = false;
        let verdict = validator.validate(&context).await;
        assert!(verdict.requires_approval);
    }

    #[tokio::test]
    async fn unparseable_sql_routes_to_repair_once() {
        let schema = schema();
        let validator = validator();
        let verdict = validator.validate(&ctx("SELECT FROM WHERE", &schema)).await;
        assert!(verdict.needs_repair);
        assert!(verdict.valid);

        let mut repaired = ctx("SELECT FROM WHERE", &schema);
        repaired.repair_attempted = true;
        let verdict = validator.validate(&repaired).await;
        assert!(!verdict.valid);
        assert!(!verdict.needs_repair);
    }
}
