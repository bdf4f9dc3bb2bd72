//! Schema fetching and the KV-backed schema/sample caches.
//!
//! Keys: `schema:<db_kind>` (TTL `schema_cache_ttl_s`) and
//! `sample:<TABLE>` (TTL `sample_cache_ttl_s`). Invalidation clears by
//! prefix with a non-blocking scan. A failing KV store degrades to
//! fetch-through; it never fails a ticket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::dialect::DatabaseKind;
use crate::driver::DatabaseDriver;
use crate::error::{ParleQLError, Result};
use crate::kv::KvStore;

use super::{ColumnInfo, SchemaSnapshot};

/// Upper bound on tables pulled into one snapshot. Catalogs beyond this
/// are truncated with a warning; the gateway targets curated reporting
/// schemas, not whole warehouses.
const MAX_TABLES_PER_SNAPSHOT: usize = 200;

/// Fetches, caches, and invalidates schema snapshots and sample rows.
pub struct SchemaService {
    kv: Arc<dyn KvStore>,
    schema_ttl: Duration,
    sample_ttl: Duration,
    fetch_timeout: Duration,
}

impl SchemaService {
    /// Create a service over a KV store.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        schema_ttl: Duration,
        sample_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            kv,
            schema_ttl,
            sample_ttl,
            fetch_timeout,
        }
    }

    /// Current snapshot for a backend: cache hit or fetch-through.
    pub async fn snapshot(
        &self,
        kind: DatabaseKind,
        driver: &Arc<dyn DatabaseDriver>,
    ) -> Result<Arc<SchemaSnapshot>> {
        let key = format!("schema:{kind}");
        match self.kv.get(&key).await {
            Ok(Some(cached)) => {
                if let Ok(snapshot) = serde_json::from_str::<SchemaSnapshot>(&cached) {
                    debug!(database = %kind, "schema cache hit");
                    return Ok(Arc::new(snapshot));
                }
                warn!(database = %kind, "schema cache entry undeserializable; refetching");
            }
            Ok(None) => {}
            Err(e) => warn!(database = %kind, error = %e, "schema cache read failed; fetching"),
        }

        let snapshot = self.fetch(kind, driver).await?;
        match serde_json::to_string(&snapshot) {
            Ok(serialized) => {
                if let Err(e) = self.kv.setex(&key, self.schema_ttl, &serialized).await {
                    warn!(database = %kind, error = %e, "schema cache write failed");
                }
            }
            Err(e) => warn!(database = %kind, error = %e, "schema snapshot serialization failed"),
        }
        Ok(Arc::new(snapshot))
    }

    /// Drop cached snapshots. `None` clears every backend.
    pub async fn invalidate(&self, kind: Option<DatabaseKind>) -> Result<u64> {
        let prefix = match kind {
            Some(k) => format!("schema:{k}"),
            None => "schema:".to_string(),
        };
        let keys = self.kv.scan_prefix(&prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.kv.delete(&keys).await
    }

    /// Sample rows for a table: cache hit or probe-through.
    ///
    /// The probe is a plain limited SELECT; failures return an empty
    /// sample rather than an error because samples only enrich prompts.
    pub async fn sample_rows(
        &self,
        kind: DatabaseKind,
        driver: &Arc<dyn DatabaseDriver>,
        table: &str,
        n: u64,
    ) -> Vec<Vec<JsonValue>> {
        let key = format!("sample:{}", table.to_ascii_uppercase());
        if let Ok(Some(cached)) = self.kv.get(&key).await {
            if let Ok(rows) = serde_json::from_str::<Vec<Vec<JsonValue>>>(&cached) {
                return rows;
            }
        }
        let sql = format!("SELECT * FROM {table} {}", kind.limit_clause(n));
        let rows = match driver.execute(&sql, self.fetch_timeout).await {
            Ok(result) => result.rows,
            Err(e) => {
                debug!(table, error = %e, "sample probe failed");
                Vec::new()
            }
        };
        if let Ok(serialized) = serde_json::to_string(&rows) {
            if let Err(e) = self.kv.setex(&key, self.sample_ttl, &serialized).await {
                warn!(table, error = %e, "sample cache write failed");
            }
        }
        rows
    }

    /// Fetch a fresh snapshot through the driver's catalog.
    async fn fetch(
        &self,
        kind: DatabaseKind,
        driver: &Arc<dyn DatabaseDriver>,
    ) -> Result<SchemaSnapshot> {
        let fetch = async {
            let listing = driver
                .execute(kind.catalog_tables_sql(), self.fetch_timeout)
                .await?;
            let mut names: Vec<String> = listing
                .rows
                .iter()
                .filter_map(|row| row.first())
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect();
            if names.len() > MAX_TABLES_PER_SNAPSHOT {
                warn!(
                    database = %kind,
                    total = names.len(),
                    kept = MAX_TABLES_PER_SNAPSHOT,
                    "catalog truncated"
                );
                names.truncate(MAX_TABLES_PER_SNAPSHOT);
            }

            let mut snapshot = SchemaSnapshot::default();
            for name in names {
                let descriptors = driver.describe(&name).await?;
                let columns: Vec<ColumnInfo> = descriptors
                    .iter()
                    .map(|d| ColumnInfo::from_descriptor(d, kind))
                    .collect();
                snapshot.tables.insert(name, columns);
            }
            Ok::<SchemaSnapshot, ParleQLError>(snapshot)
        };

        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(ParleQLError::schema_unavailable(kind.as_str(), e.to_string())),
            Err(_) => Err(ParleQLError::schema_unavailable(
                kind.as_str(),
                format!("schema fetch timed out after {:?}", self.fetch_timeout),
            )),
        }
    }
}
