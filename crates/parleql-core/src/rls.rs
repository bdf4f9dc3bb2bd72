//! Row-level security contract.
//!
//! The RLS collaborator may rewrite SQL to add per-user predicates. The
//! validator calls it after the row-limit stage and records whether a
//! rewrite was applied; the pipeline trusts the returned SQL as-is.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of an RLS enforcement call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RlsOutcome {
    /// The SQL to use from here on (possibly unchanged).
    pub modified_sql: String,
    /// Whether any policy rewrote the SQL.
    pub applied: bool,
    /// Explanation in user terms.
    pub reason: String,
    /// Names of the policies that applied.
    #[serde(default)]
    pub policies_applied: Vec<String>,
}

/// The RLS service collaborator.
#[async_trait]
pub trait RlsService: Send + Sync {
    /// Enforce row-level policies for `user_id`/`role`, returning possibly
    /// rewritten SQL.
    async fn enforce(
        &self,
        sql: &str,
        user_id: &str,
        role: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<RlsOutcome>;
}

/// RLS service that applies no policies.
#[derive(Debug, Default)]
pub struct AllowAllRls;

#[async_trait]
impl RlsService for AllowAllRls {
    async fn enforce(
        &self,
        sql: &str,
        _user_id: &str,
        _role: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<RlsOutcome> {
        Ok(RlsOutcome {
            modified_sql: sql.to_string(),
            applied: false,
            reason: "no row-level policies configured".to_string(),
            policies_applied: Vec::new(),
        })
    }
}
