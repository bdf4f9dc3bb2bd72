//! Executor facade: pool dispatch, circuit breaking, result caching,
//! and result normalization over the [`DatabaseDriver`] collaborators.

pub mod breaker;
pub mod oracle_rpc;
pub mod result_cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::dialect::DatabaseKind;
use crate::driver::{ColumnDescriptor, DatabaseDriver};
use crate::error::{ParleQLError, Result};
use crate::kv::KvStore;
use crate::types::{CacheStatus, ExecutionResult, ExecutionStatus};

use breaker::CircuitBreaker;
use result_cache::{AdaptiveTtl, ResultCache};

struct Backend {
    driver: Arc<dyn DatabaseDriver>,
    fallback: Option<Arc<dyn DatabaseDriver>>,
    slots: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

/// Dialect-keyed dispatch over pooled drivers.
pub struct ExecutorFacade {
    backends: DashMap<DatabaseKind, Arc<Backend>>,
    cache: ResultCache,
    config: CoreConfig,
}

impl ExecutorFacade {
    /// Create a facade with the configured cache tiers and no backends.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: CoreConfig) -> Self {
        let cache = ResultCache::new(
            kv,
            AdaptiveTtl {
                small: Duration::from_secs(config.result_cache_small_ttl_s),
                medium: Duration::from_secs(config.result_cache_medium_ttl_s),
                large: Duration::from_secs(config.result_cache_large_ttl_s),
            },
            config.result_cache_cap,
        );
        Self {
            backends: DashMap::new(),
            cache,
            config,
        }
    }

    /// Register a backend's pooled driver, with an optional
    /// single-instance fallback for pool exhaustion.
    pub fn register_backend(
        &self,
        kind: DatabaseKind,
        driver: Arc<dyn DatabaseDriver>,
        fallback: Option<Arc<dyn DatabaseDriver>>,
    ) {
        self.backends.insert(
            kind,
            Arc::new(Backend {
                driver,
                fallback,
                slots: Arc::new(Semaphore::new(self.config.pool_max)),
                breaker: CircuitBreaker::new(
                    kind.as_str(),
                    self.config.breaker_threshold,
                    Duration::from_secs(self.config.breaker_cool_off_s),
                ),
            }),
        );
    }

    /// Registered backend kinds.
    #[must_use]
    pub fn registered_backends(&self) -> Vec<DatabaseKind> {
        self.backends.iter().map(|e| *e.key()).collect()
    }

    /// Driver handle for schema fetching and validation probes.
    #[must_use]
    pub fn driver_for(&self, kind: DatabaseKind) -> Option<Arc<dyn DatabaseDriver>> {
        self.backends.get(&kind).map(|b| Arc::clone(&b.driver))
    }

    /// Execute SQL against a backend.
    ///
    /// # Errors
    ///
    /// - [`ParleQLError::NotFound`] for an unregistered backend.
    /// - [`ParleQLError::BreakerOpen`] while the backend's breaker is
    ///   open.
    /// - [`ParleQLError::ExecutionTimeout`] / [`ParleQLError::ExecutionError`]
    ///   from the driver.
    /// - [`ParleQLError::Cancelled`] when the token fires mid-flight; the
    ///   in-flight session is killed best-effort.
    pub async fn execute(
        &self,
        sql: &str,
        kind: DatabaseKind,
        ticket_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let backend = self
            .backends
            .get(&kind)
            .map(|b| Arc::clone(&b))
            .ok_or_else(|| ParleQLError::not_found("connection", kind.as_str()))?;

        if let Some(mut cached) = self.cache.get(sql).await {
            debug!(ticket_id, "result cache hit");
            cached.cache_status = CacheStatus::Hit;
            return Ok(cached);
        }

        backend.breaker.try_acquire()?;

        let timeout = Duration::from_secs(self.config.db_timeout_s);
        let acquire_timeout = Duration::from_secs(self.config.pool_acquire_timeout_s);

        let permit = tokio::time::timeout(acquire_timeout, Arc::clone(&backend.slots).acquire_owned())
            .await
            .ok()
            .and_then(|p| p.ok());

        let driver = match (&permit, &backend.fallback) {
            (Some(_), _) => Arc::clone(&backend.driver),
            (None, Some(fallback)) => {
                warn!(backend = %kind, "pool acquire timed out; using single-instance fallback");
                Arc::clone(fallback)
            }
            (None, None) => {
                backend.breaker.record_failure();
                return Err(ParleQLError::execution(format!(
                    "no {kind} worker available within {}s",
                    self.config.pool_acquire_timeout_s
                )));
            }
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                info!(ticket_id, backend = %kind, "cancelling in-flight session");
                if let Err(e) = driver.cancel(ticket_id).await {
                    warn!(error = %e, "session kill failed");
                }
                drop(permit);
                return Err(ParleQLError::cancelled(ticket_id, "client cancelled"));
            }
            result = driver.execute(sql, timeout) => result,
        };
        drop(permit);

        match outcome {
            Ok(result) => {
                backend.breaker.record_success();
                let mut normalized = normalize(result);
                if normalized.status == ExecutionStatus::Success {
                    self.cache.put(sql, &normalized).await;
                    normalized.cache_status = CacheStatus::Fresh;
                } else {
                    normalized.cache_status = CacheStatus::Miss;
                }
                Ok(normalized)
            }
            Err(e) => {
                backend.breaker.record_failure();
                Err(sanitize_driver_error(e))
            }
        }
    }
}

/// Canonicalize a driver result: `row_count` always equals the row list
/// length, and every row is padded or truncated to the column count.
fn normalize(mut result: ExecutionResult) -> ExecutionResult {
    let width = result.columns.len();
    for row in &mut result.rows {
        match row.len().cmp(&width) {
            std::cmp::Ordering::Less => row.resize(width, JsonValue::Null),
            std::cmp::Ordering::Greater => row.truncate(width),
            std::cmp::Ordering::Equal => {}
        }
    }
    result.row_count = result.rows.len();
    result
}

/// Keep driver messages, drop driver internals (connect strings, stack
/// frames) from anything user-visible.
fn sanitize_driver_error(error: ParleQLError) -> ParleQLError {
    match error {
        ParleQLError::ExecutionError { message } => {
            let first_line = message.lines().next().unwrap_or("execution failed");
            let cleaned: String = first_line.chars().take(200).collect();
            ParleQLError::execution(cleaned)
        }
        other => other,
    }
}

// ============================================================================
// Oracle subprocess driver
// ============================================================================

/// [`DatabaseDriver`] over the SQLcl JSON-RPC bridge.
pub struct OracleSubprocessDriver {
    client: oracle_rpc::OracleRpcClient,
    cancel: CancellationToken,
}

impl OracleSubprocessDriver {
    /// Spawn the bridge process and wrap it as a driver.
    pub async fn spawn(program: &str, args: &[String]) -> Result<Self> {
        Ok(Self {
            client: oracle_rpc::OracleRpcClient::spawn(program, args).await?,
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl DatabaseDriver for OracleSubprocessDriver {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecutionResult> {
        let mut params = HashMap::new();
        params.insert("sql".to_string(), JsonValue::String(sql.to_string()));
        params.insert(
            "timeout_s".to_string(),
            JsonValue::from(timeout.as_secs()),
        );
        let result = self
            .client
            .call("execute", params, "", timeout, &self.cancel)
            .await?;

        let columns: Vec<String> = result
            .get("columns")
            .and_then(JsonValue::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let rows: Vec<Vec<JsonValue>> = result
            .get("rows")
            .and_then(JsonValue::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|r| r.as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();
        let execution_time_ms = result
            .get("execution_time_ms")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        Ok(ExecutionResult::success(columns, rows, execution_time_ms))
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert(
            "session_id".to_string(),
            JsonValue::String(session_id.to_string()),
        );
        self.client
            .call("cancel", params, session_id, Duration::from_secs(10), &self.cancel)
            .await
            .map(|_| ())
    }

    async fn describe(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut params = HashMap::new();
        params.insert("table".to_string(), JsonValue::String(table.to_string()));
        let result = self
            .client
            .call("describe", params, "", Duration::from_secs(30), &self.cancel)
            .await?;
        let columns = result
            .get("columns")
            .and_then(JsonValue::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|c| {
                        Some(ColumnDescriptor {
                            name: c.get("name")?.as_str()?.to_string(),
                            data_type: c
                                .get("type")
                                .and_then(JsonValue::as_str)
                                .unwrap_or("VARCHAR2")
                                .to_string(),
                            nullable: c
                                .get("nullable")
                                .and_then(JsonValue::as_bool)
                                .unwrap_or(true),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(columns)
    }

    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Oracle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    struct ScriptedDriver {
        kind: DatabaseKind,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DatabaseDriver for ScriptedDriver {
        async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<ExecutionResult> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(ParleQLError::execution("ORA-00942: table or view does not exist\nstack: ..."));
            }
            Ok(ExecutionResult::success(
                vec!["n".to_string()],
                vec![vec![json!(1)], vec![json!(2)]],
                7,
            ))
        }

        async fn cancel(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }

        async fn describe(&self, _table: &str) -> Result<Vec<ColumnDescriptor>> {
            Ok(Vec::new())
        }

        fn kind(&self) -> DatabaseKind {
            self.kind
        }
    }

    fn facade_with(driver: Arc<ScriptedDriver>) -> ExecutorFacade {
        let facade = ExecutorFacade::new(Arc::new(MemoryKv::new()), CoreConfig::default());
        facade.register_backend(DatabaseKind::Postgres, driver, None);
        facade
    }

    #[tokio::test]
    async fn execute_normalizes_and_caches() {
        let driver = Arc::new(ScriptedDriver {
            kind: DatabaseKind::Postgres,
            fail: false.into(),
        });
        let facade = facade_with(driver);
        let cancel = CancellationToken::new();

        let first = facade
            .execute("SELECT n FROM t", DatabaseKind::Postgres, "q_11111111", &cancel)
            .await
            .expect("executes");
        assert_eq!(first.cache_status, CacheStatus::Fresh);
        assert_eq!(first.row_count, 2);

        let second = facade
            .execute("SELECT n FROM t", DatabaseKind::Postgres, "q_11111111", &cancel)
            .await
            .expect("executes");
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.rows, first.rows);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let driver = Arc::new(ScriptedDriver {
            kind: DatabaseKind::Postgres,
            fail: true.into(),
        });
        let facade = facade_with(Arc::clone(&driver));
        let cancel = CancellationToken::new();

        for i in 0..5 {
            let err = facade
                .execute(&format!("SELECT {i} FROM t"), DatabaseKind::Postgres, "q_11111111", &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, ParleQLError::ExecutionError { .. }));
        }
        let err = facade
            .execute("SELECT 99 FROM t", DatabaseKind::Postgres, "q_11111111", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleQLError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn driver_errors_are_sanitized_to_one_line() {
        let driver = Arc::new(ScriptedDriver {
            kind: DatabaseKind::Postgres,
            fail: true.into(),
        });
        let facade = facade_with(driver);
        let err = facade
            .execute("SELECT n FROM t", DatabaseKind::Postgres, "q_11111111", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ParleQLError::ExecutionError { message } => {
                assert!(message.contains("ORA-00942"));
                assert!(!message.contains("stack"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let facade = ExecutorFacade::new(Arc::new(MemoryKv::new()), CoreConfig::default());
        let err = facade
            .execute("SELECT 1", DatabaseKind::Doris, "q_11111111", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParleQLError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_session() {
        struct SlowDriver;
        #[async_trait]
        impl DatabaseDriver for SlowDriver {
            async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<ExecutionResult> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ExecutionResult::empty(ExecutionStatus::Success))
            }
            async fn cancel(&self, _session_id: &str) -> Result<()> {
                Ok(())
            }
            async fn describe(&self, _table: &str) -> Result<Vec<ColumnDescriptor>> {
                Ok(Vec::new())
            }
            fn kind(&self) -> DatabaseKind {
                DatabaseKind::Postgres
            }
        }
        let facade = ExecutorFacade::new(Arc::new(MemoryKv::new()), CoreConfig::default());
        facade.register_backend(DatabaseKind::Postgres, Arc::new(SlowDriver), None);
        let cancel = CancellationToken::new();
        let run = facade.execute("SELECT pg_sleep(60)", DatabaseKind::Postgres, "q_22222222", &cancel);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("should not complete"),
            () = tokio::time::sleep(Duration::from_millis(20)) => cancel.cancel(),
        }
        let err = run.await.unwrap_err();
        assert!(matches!(err, ParleQLError::Cancelled { .. }));
    }
}
