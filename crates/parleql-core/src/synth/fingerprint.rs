//! Generated-SQL fingerprint cache.
//!
//! Key: `sqlfp:sha256(db_kind | schema_fingerprint | normalized_text |
//! normalized_intent)`. A hit skips the LLM entirely. TTL is long
//! (default 30 days) because entries self-invalidate through the schema
//! fingerprint baked into the key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::dialect::DatabaseKind;
use crate::kv::KvStore;

/// Cached generation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// The post-processed SQL.
    pub sql: String,
    /// Generator confidence at cache time.
    pub confidence: u8,
    /// When the entry was written.
    pub cached_at: DateTime<Utc>,
    /// Times this entry has been served.
    pub usage_count: u64,
}

/// Collapse whitespace and case so trivially-different phrasings of the
/// same question share a fingerprint.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compute the cache key.
#[must_use]
pub fn key(
    db_kind: DatabaseKind,
    schema_fingerprint: &str,
    user_text: &str,
    intent: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(db_kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(schema_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_text(user_text).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_text(intent).as_bytes());
    format!("sqlfp:{}", hex::encode(hasher.finalize()))
}

/// KV-backed fingerprint cache. All failures degrade to a miss.
pub struct FingerprintCache {
    kv:  Arc<dyn KvStore>,
    ttl: Duration,
}

impl FingerprintCache {
    /// Create a cache with the configured TTL.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Look up an entry; a hit bumps `usage_count`.
    pub async fn get(&self, cache_key: &str) -> Option<FingerprintEntry> {
        let raw = match self.kv.get(cache_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "fingerprint cache read failed; treating as miss");
                return None;
            }
        };
        let mut entry: FingerprintEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "fingerprint cache entry undeserializable; dropping");
                let _ = self.kv.delete(&[cache_key.to_string()]).await;
                return None;
            }
        };
        entry.usage_count += 1;
        if let Ok(serialized) = serde_json::to_string(&entry) {
            if let Err(e) = self.kv.setex(cache_key, self.ttl, &serialized).await {
                warn!(error = %e, "fingerprint usage-count write failed");
            }
        }
        Some(entry)
    }

    /// Store a fresh entry.
    pub async fn put(&self, cache_key: &str, sql: &str, confidence: u8) {
        let entry = FingerprintEntry {
            sql: sql.to_string(),
            confidence,
            cached_at: Utc::now(),
            usage_count: 0,
        };
        match serde_json::to_string(&entry) {
            Ok(serialized) => {
                if let Err(e) = self.kv.setex(cache_key, self.ttl, &serialized).await {
                    warn!(error = %e, "fingerprint cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "fingerprint entry serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn key_is_stable_under_whitespace_and_case() {
        let a = key(DatabaseKind::Postgres, "fp", "Total  Sales by Region", "data");
        let b = key(DatabaseKind::Postgres, "fp", "total sales by region", "data");
        assert_eq!(a, b);
        let c = key(DatabaseKind::Oracle, "fp", "total sales by region", "data");
        assert_ne!(a, c);
        let d = key(DatabaseKind::Postgres, "other-fp", "total sales by region", "data");
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn round_trip_bumps_usage() {
        let cache = FingerprintCache::new(Arc::new(MemoryKv::new()), Duration::from_secs(60));
        let k = key(DatabaseKind::Postgres, "fp", "q", "data");
        assert!(cache.get(&k).await.is_none());
        cache.put(&k, "SELECT 1", 90).await;
        let first = cache.get(&k).await.expect("hit");
        assert_eq!(first.sql, "SELECT 1");
        assert_eq!(first.usage_count, 1);
        let second = cache.get(&k).await.expect("hit");
        assert_eq!(second.usage_count, 2);
    }
}
