//! Core configuration.
//!
//! Every knob the pipeline recognizes is declared here with its default.
//! Configuration loads from TOML with environment-variable overrides
//! (`PARLEQL_` prefix) and is validated once at startup; the composition
//! root then hands an immutable copy to every component.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cost::CostLevel;
use crate::error::{ParleQLError, Result};

/// Per-role scope limits consumed by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoleLimits {
    /// Maximum number of distinct tables a query may touch.
    pub max_tables: usize,
    /// Maximum number of JOINs a query may contain.
    pub max_joins: usize,
    /// Row cap rewritten into SELECTs. `None` means unlimited (admin).
    pub max_rows: Option<u64>,
    /// Daily query quota. `None` means unmetered.
    pub daily_query_quota: Option<u64>,
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            max_tables:        4,
            max_joins:         3,
            max_rows:          Some(1000),
            daily_query_quota: Some(200),
        }
    }
}

impl RoleLimits {
    /// Limits for the admin role: unbounded rows and quota, generous scope.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            max_tables:        16,
            max_joins:         15,
            max_rows:          None,
            daily_query_quota: None,
        }
    }
}

/// The recognized configuration options, exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Hard cap on state-machine iterations per ticket (loop prevention).
    pub max_iterations: u32,
    /// LLM request timeout, seconds.
    pub llm_timeout_s: u64,
    /// Database execution timeout, seconds.
    pub db_timeout_s: u64,
    /// Schema fetch timeout, seconds.
    pub schema_fetch_timeout_s: u64,
    /// Schema metadata cache TTL, seconds.
    pub schema_cache_ttl_s: u64,
    /// Sample-row cache TTL, seconds.
    pub sample_cache_ttl_s: u64,
    /// Result-cache entry-count cap (LRU eviction above this).
    pub result_cache_cap: usize,
    /// Result-cache TTL for small results (<= 100 rows), seconds.
    pub result_cache_small_ttl_s: u64,
    /// Result-cache TTL for medium results (<= 1000 rows), seconds.
    pub result_cache_medium_ttl_s: u64,
    /// Result-cache TTL for large results, seconds.
    pub result_cache_large_ttl_s: u64,
    /// Generated-SQL fingerprint cache TTL, seconds.
    pub fingerprint_cache_ttl_s: u64,
    /// Checkpoint TTL, seconds. Tickets expire from the store after this.
    pub checkpoint_ttl_s: u64,
    /// Per-backend pool minimum size.
    pub pool_min: usize,
    /// Per-backend pool maximum size.
    pub pool_max: usize,
    /// Pool acquire timeout, seconds.
    pub pool_acquire_timeout_s: u64,
    /// Consecutive failures before a backend's circuit breaker opens.
    pub breaker_threshold: u32,
    /// Breaker cool-off before the half-open probe, seconds.
    pub breaker_cool_off_s: u64,
    /// Risk levels that force the approval gate.
    pub approval_risk_levels_that_require: Vec<String>,
    /// Tables whose mere presence forces approval.
    pub sensitive_tables: Vec<String>,
    /// Per-role scope limits, keyed by role name. Unknown roles fall back
    /// to [`RoleLimits::default`].
    pub role_limits: HashMap<String, RoleLimits>,
    /// Cost level at or above which approval is forced.
    pub cost_level_requiring_approval: CostLevel,
    /// Cost level at or above which non-admin queries are blocked.
    pub cost_level_blocking: CostLevel,
    /// Default auto-approve preference when the client does not send one.
    pub auto_approve_default: bool,
    /// Maximum pivot (strategy-rotation) retries per ticket.
    pub max_pivots: u32,
    /// Enable the router's LLM fallback for inconclusive pattern matches.
    pub router_llm_fallback: bool,
    /// Track user sentiment and adapt responses for frustrated users.
    pub sentiment_tracking_enabled: bool,
    /// Mine successful queries for reusable skills.
    pub skill_generation_enabled: bool,
    /// Development mode: anonymous SSE access, permissive ownership checks.
    pub dev_mode: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut role_limits = HashMap::new();
        role_limits.insert("admin".to_string(), RoleLimits::admin());
        role_limits.insert("analyst".to_string(), RoleLimits::default());
        role_limits.insert(
            "viewer".to_string(),
            RoleLimits {
                max_tables:        2,
                max_joins:         1,
                max_rows:          Some(200),
                daily_query_quota: Some(50),
            },
        );
        Self {
            max_iterations: 40,
            llm_timeout_s: 60,
            db_timeout_s: 600,
            schema_fetch_timeout_s: 30,
            schema_cache_ttl_s: 3600,
            sample_cache_ttl_s: 1800,
            result_cache_cap: 1000,
            result_cache_small_ttl_s: 1800,
            result_cache_medium_ttl_s: 600,
            result_cache_large_ttl_s: 300,
            fingerprint_cache_ttl_s: 30 * 24 * 3600,
            checkpoint_ttl_s: 7 * 24 * 3600,
            pool_min: 1,
            pool_max: 8,
            pool_acquire_timeout_s: 10,
            breaker_threshold: 5,
            breaker_cool_off_s: 30,
            approval_risk_levels_that_require: vec!["high".to_string(), "critical".to_string()],
            sensitive_tables: vec![
                "USERS".to_string(),
                "CREDENTIALS".to_string(),
                "USER_SESSIONS".to_string(),
                "AUDIT_LOG".to_string(),
            ],
            role_limits,
            cost_level_requiring_approval: CostLevel::High,
            cost_level_blocking: CostLevel::Critical,
            auto_approve_default: false,
            max_pivots: 2,
            router_llm_fallback: false,
            sentiment_tracking_enabled: true,
            skill_generation_enabled: true,
            dev_mode: false,
        }
    }
}

impl CoreConfig {
    /// Load from a TOML string, apply environment overrides, validate.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ParleQLError::Internal {
            message: format!("invalid configuration: {e}"),
            source:  Some(Box::new(e)),
        })?;
        config.validated()
    }

    /// Apply `PARLEQL_`-prefixed environment overrides for the numeric
    /// knobs most often tuned per deployment.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        if let Some(v) = env_u64("PARLEQL_MAX_ITERATIONS") {
            self.max_iterations = u32::try_from(v).unwrap_or(self.max_iterations);
        }
        if let Some(v) = env_u64("PARLEQL_LLM_TIMEOUT_S") {
            self.llm_timeout_s = v;
        }
        if let Some(v) = env_u64("PARLEQL_DB_TIMEOUT_S") {
            self.db_timeout_s = v;
        }
        if let Some(v) = env_u64("PARLEQL_RESULT_CACHE_CAP") {
            self.result_cache_cap = usize::try_from(v).unwrap_or(self.result_cache_cap);
        }
        if let Ok(v) = std::env::var("PARLEQL_DEV_MODE") {
            self.dev_mode = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Validate invariants between options.
    pub fn validated(self) -> Result<Self> {
        if self.max_iterations == 0 {
            return Err(ParleQLError::internal("max_iterations must be positive"));
        }
        if self.pool_min > self.pool_max {
            return Err(ParleQLError::internal(format!(
                "pool_min ({}) exceeds pool_max ({})",
                self.pool_min, self.pool_max
            )));
        }
        if self.result_cache_cap == 0 {
            return Err(ParleQLError::internal("result_cache_cap must be positive"));
        }
        if self.cost_level_blocking < self.cost_level_requiring_approval {
            return Err(ParleQLError::internal(
                "cost_level_blocking must be at or above cost_level_requiring_approval",
            ));
        }
        Ok(self)
    }

    /// Limits for a role, falling back to the default profile.
    #[must_use]
    pub fn limits_for_role(&self, role: &str) -> RoleLimits {
        self.role_limits
            .get(role)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `role` is the administrative role.
    #[must_use]
    pub fn is_admin_role(role: &str) -> bool {
        role.eq_ignore_ascii_case("admin")
    }
}
