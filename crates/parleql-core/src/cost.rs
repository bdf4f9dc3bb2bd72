//! Cost estimation contract.
//!
//! The validator consults a cost estimator before letting a query run.
//! Deployments wire a backend-specific estimator (EXPLAIN-based); the
//! built-in heuristic estimator keeps the pipeline honest when none is
//! configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseKind;
use crate::error::Result;

/// Qualitative cost buckets, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CostLevel {
    /// Trivial.
    Low,
    /// Normal.
    Medium,
    /// Force approval territory.
    High,
    /// Blocking territory for non-admins.
    Critical,
}

impl CostLevel {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Estimator output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostEstimate {
    /// Planner cost units (backend-specific scale).
    pub total_cost: f64,
    /// Expected output cardinality.
    pub cardinality: u64,
    /// Qualitative level.
    pub level: CostLevel,
    /// Whether a full-table scan is expected.
    pub has_full_scan: bool,
    /// Human-readable warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// At most three actionable recommendations.
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Raw plan text, when requested and available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// The cost estimator collaborator.
#[async_trait]
pub trait CostEstimator: Send + Sync {
    /// Estimate the cost of running `sql` against `dialect`.
    async fn estimate(
        &self,
        sql: &str,
        dialect: DatabaseKind,
        include_plan: bool,
    ) -> Result<CostEstimate>;
}

/// Heuristic estimator used when no EXPLAIN-backed estimator is wired.
///
/// Scores on visible structure only: table count, join count, presence of
/// a WHERE clause, aggregation, and an explicit row limit. Deliberately
/// pessimistic about un-filtered multi-table queries.
#[derive(Debug, Default)]
pub struct HeuristicCostEstimator;

#[async_trait]
impl CostEstimator for HeuristicCostEstimator {
    async fn estimate(
        &self,
        sql: &str,
        _dialect: DatabaseKind,
        _include_plan: bool,
    ) -> Result<CostEstimate> {
        let upper = sql.to_ascii_uppercase();
        let join_count = upper.matches(" JOIN ").count() as u64;
        let has_where = upper.contains(" WHERE ");
        let has_group = upper.contains(" GROUP BY ");
        let has_limit = upper.contains(" LIMIT ") || upper.contains("FETCH FIRST");

        let mut cost = 100.0 + 400.0 * join_count as f64;
        if !has_where {
            cost *= 4.0;
        }
        if has_group {
            cost *= 1.5;
        }

        let has_full_scan = !has_where;
        let cardinality = if has_limit {
            500
        } else if has_where {
            2_000
        } else {
            50_000
        };

        let level = if cost >= 4_000.0 {
            CostLevel::Critical
        } else if cost >= 1_200.0 {
            CostLevel::High
        } else if cost >= 400.0 {
            CostLevel::Medium
        } else {
            CostLevel::Low
        };

        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();
        if has_full_scan {
            warnings.push("query has no WHERE clause; full-table scan likely".to_string());
            recommendations.push("add a date or key filter to bound the scan".to_string());
        }
        if join_count > 2 {
            warnings.push(format!("{join_count} joins may be expensive"));
            recommendations.push("restrict the query to fewer tables".to_string());
        }
        if !has_limit {
            recommendations.push("add an explicit row limit".to_string());
        }
        recommendations.truncate(3);

        Ok(CostEstimate {
            total_cost: cost,
            cardinality,
            level,
            has_full_scan,
            warnings,
            recommendations,
            plan: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(CostLevel::Low < CostLevel::Medium);
        assert!(CostLevel::High < CostLevel::Critical);
    }

    #[tokio::test]
    async fn unfiltered_join_scores_high() {
        let est = HeuristicCostEstimator
            .estimate(
                "SELECT * FROM a JOIN b ON a.id = b.id JOIN c ON b.id = c.id",
                DatabaseKind::Postgres,
                false,
            )
            .await
            .unwrap();
        assert!(est.level >= CostLevel::High);
        assert!(est.has_full_scan);
        assert!(est.recommendations.len() <= 3);
    }

    #[tokio::test]
    async fn filtered_limited_select_is_cheap() {
        let est = HeuristicCostEstimator
            .estimate(
                "SELECT region FROM orders WHERE year = 2024 LIMIT 100",
                DatabaseKind::Postgres,
                false,
            )
            .await
            .unwrap();
        assert_eq!(est.level, CostLevel::Low);
        assert!(!est.has_full_scan);
    }
}
