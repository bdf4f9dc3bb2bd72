//! Database driver contract.
//!
//! Native clients (Oracle SQLcl subprocess, Postgres driver, Doris client)
//! live outside the core; the executor facade and the schema fetcher talk
//! to them exclusively through this trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseKind;
use crate::error::Result;
use crate::types::ExecutionResult;

/// Raw column shape as reported by a backend's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Canonical-case column name as the backend reports it.
    pub name:      String,
    /// Backend type name (e.g. `NUMBER(10,2)`, `timestamp with time zone`).
    pub data_type: String,
    /// Whether NULLs are allowed.
    pub nullable:  bool,
}

/// The database driver collaborator.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Execute SQL with a per-query timeout and return the canonical
    /// result shape.
    ///
    /// # Errors
    ///
    /// [`crate::error::ParleQLError::ExecutionTimeout`] on timeout,
    /// [`crate::error::ParleQLError::ExecutionError`] with a sanitized
    /// message on driver failure.
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecutionResult>;

    /// Kill an in-flight session via the backend-specific mechanism.
    async fn cancel(&self, session_id: &str) -> Result<()>;

    /// Describe a table's columns in the backend's canonical case.
    async fn describe(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Which backend this driver speaks to.
    fn kind(&self) -> DatabaseKind;

    /// Verify connectivity. Defaults to a no-op for drivers without a
    /// cheap probe.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
