//! Fingerprint-keyed result cache with adaptive TTL and LRU eviction.
//!
//! Values live under `query:<sha256>`; recency lives in the
//! `query:cache_index` sorted set, scored by insertion/access time.
//! When the index grows past the cap, the oldest tenth is trimmed by
//! rank. The two structures can drift under partial failure; index
//! members whose value keys have expired are treated as no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::types::ExecutionResult;

/// Sorted-set key tracking recency.
const INDEX_KEY: &str = "query:cache_index";

/// Stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResult {
    result: ExecutionResult,
    cached_at: i64,
    row_count: usize,
    ttl_s: u64,
}

/// TTL tiers by result size.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveTtl {
    /// TTL for results with at most 100 rows.
    pub small: Duration,
    /// TTL for results with at most 1000 rows.
    pub medium: Duration,
    /// TTL for everything larger.
    pub large: Duration,
}

impl AdaptiveTtl {
    /// Pick the TTL tier for a row count.
    #[must_use]
    pub fn for_rows(&self, rows: usize) -> Duration {
        if rows <= 100 {
            self.small
        } else if rows <= 1000 {
            self.medium
        } else {
            self.large
        }
    }
}

/// Cache key for a normalized SQL text.
#[must_use]
pub fn result_key(sql: &str) -> String {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("query:{}", hex::encode(hasher.finalize()))
}

/// The result cache. Every failure degrades to bypass.
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    ttl: AdaptiveTtl,
    cap: usize,
}

impl ResultCache {
    /// Create a cache with the configured tiers and cap.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl: AdaptiveTtl, cap: usize) -> Self {
        Self { kv, ttl, cap }
    }

    /// Look up a result; a hit refreshes its recency score.
    pub async fn get(&self, sql: &str) -> Option<ExecutionResult> {
        let key = result_key(sql);
        let raw = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "result cache read failed; bypassing");
                return None;
            }
        };
        let entry: CachedResult = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "result cache entry undeserializable; dropping");
                let _ = self.kv.delete(&[key]).await;
                return None;
            }
        };
        let _ = self
            .kv
            .zadd(INDEX_KEY, &key, Utc::now().timestamp_millis() as f64)
            .await;
        Some(entry.result)
    }

    /// Insert a result with its size-appropriate TTL, trimming the LRU
    /// index when over cap.
    pub async fn put(&self, sql: &str, result: &ExecutionResult) {
        let key = result_key(sql);
        let ttl = self.ttl.for_rows(result.row_count);
        let entry = CachedResult {
            result: result.clone(),
            cached_at: Utc::now().timestamp(),
            row_count: result.row_count,
            ttl_s: ttl.as_secs(),
        };
        let Ok(serialized) = serde_json::to_string(&entry) else {
            return;
        };
        if let Err(e) = self.kv.setex(&key, ttl, &serialized).await {
            warn!(error = %e, "result cache write failed; bypassing");
            return;
        }
        let _ = self
            .kv
            .zadd(INDEX_KEY, &key, Utc::now().timestamp_millis() as f64)
            .await;
        self.trim().await;
    }

    /// Evict the oldest tenth once the index exceeds the cap.
    async fn trim(&self) {
        let count = match self.kv.zcard(INDEX_KEY).await {
            Ok(count) => count as usize,
            Err(_) => return,
        };
        if count <= self.cap {
            return;
        }
        let evict = (self.cap / 10).max(1) as i64;
        let victims = match self.kv.zrange(INDEX_KEY, 0, evict - 1).await {
            Ok(victims) => victims,
            Err(_) => return,
        };
        let keys: Vec<String> = victims.into_iter().map(|m| m.member).collect();
        if keys.is_empty() {
            return;
        }
        debug!(evicted = keys.len(), "result cache LRU trim");
        // Value keys may already have expired; deleting them is a no-op
        // then, which is fine.
        let _ = self.kv.delete(&keys).await;
        let _ = self.kv.zremrangebyrank(INDEX_KEY, 0, evict - 1).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::types::{CacheStatus, ExecutionStatus};
    use serde_json::json;

    fn small_result(rows: usize) -> ExecutionResult {
        ExecutionResult {
            columns: vec!["n".to_string()],
            rows: (0..rows).map(|i| vec![json!(i)]).collect(),
            row_count: rows,
            execution_time_ms: 1,
            status: ExecutionStatus::Success,
            data_quality: None,
            cache_status: CacheStatus::Fresh,
        }
    }

    fn cache(kv: Arc<MemoryKv>, cap: usize) -> ResultCache {
        ResultCache::new(
            kv,
            AdaptiveTtl {
                small: Duration::from_secs(1800),
                medium: Duration::from_secs(600),
                large: Duration::from_secs(300),
            },
            cap,
        )
    }

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let cache = cache(Arc::new(MemoryKv::new()), 10);
        let result = small_result(3);
        cache.put("SELECT a FROM t", &result).await;
        let fetched = cache.get("select a from t").await.expect("hit");
        assert_eq!(fetched.columns, result.columns);
        assert_eq!(fetched.rows, result.rows);
        assert_eq!(fetched.row_count, result.row_count);
    }

    #[tokio::test]
    async fn miss_on_different_sql() {
        let cache = cache(Arc::new(MemoryKv::new()), 10);
        cache.put("SELECT a FROM t", &small_result(1)).await;
        assert!(cache.get("SELECT b FROM t").await.is_none());
    }

    #[tokio::test]
    async fn lru_trim_evicts_oldest() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(Arc::clone(&kv), 5);
        for i in 0..6 {
            cache.put(&format!("SELECT {i} FROM t"), &small_result(1)).await;
        }
        // Cap 5, over by one: the oldest entry is gone.
        assert!(cache.get("SELECT 0 FROM t").await.is_none());
        assert!(cache.get("SELECT 5 FROM t").await.is_some());
    }

    #[test]
    fn adaptive_ttl_tiers() {
        let ttl = AdaptiveTtl {
            small: Duration::from_secs(1800),
            medium: Duration::from_secs(600),
            large: Duration::from_secs(300),
        };
        assert_eq!(ttl.for_rows(100), Duration::from_secs(1800));
        assert_eq!(ttl.for_rows(101), Duration::from_secs(600));
        assert_eq!(ttl.for_rows(1001), Duration::from_secs(300));
    }
}
