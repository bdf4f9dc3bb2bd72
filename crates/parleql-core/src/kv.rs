//! Key-value store contract and the in-memory reference implementation.
//!
//! The schema, sample, fingerprint, result, quota, and approval-history
//! caches all sit on this trait. Operations are bounded and atomic
//! single-key or small-pipeline writes; a failing store degrades the
//! caches to bypass and never fails the pipeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Sorted-set member with score, used by the result-cache LRU index.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// Member key.
    pub member: String,
    /// Score (Unix timestamp for LRU indices).
    pub score:  f64,
}

/// The KV store collaborator.
///
/// Modeled on the subset of Redis the caches need. All operations are
/// async and expected to be bounded by a short internal timeout.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set a value with a TTL.
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// Delete keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Non-blocking scan for keys matching a literal prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Add a member to a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Range of a sorted set by rank, ascending. `stop = -1` means the end.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>>;

    /// Remove members by ascending rank range; returns how many were removed.
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64>;

    /// Cardinality of a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Set a TTL on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomic increment; creates the key at 0 first.
    async fn incr(&self, key: &str) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct Entry {
    value:      String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, Entry>,
    zsets:   HashMap<String, Vec<ScoredMember>>,
}

/// In-memory [`KvStore`] used in development mode and tests.
///
/// Expiry is lazy: expired entries are dropped on the next access.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entry: &Entry) -> Option<String> {
        match entry.expires_at {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(entry.value.clone()),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(key) else {
            return Ok(None);
        };
        match Self::live_value(entry) {
            Some(value) => Ok(Some(value)),
            None => {
                inner.entries.remove(key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().entries.insert(
            key.to_string(),
            Entry {
                value:      value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        self.inner.lock().entries.insert(
            key.to_string(),
            Entry {
                value:      value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for key in keys {
            if inner.entries.remove(key).is_some() {
                removed += 1;
            }
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && Self::live_value(entry).is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|m| m.member != member);
        set.push(ScoredMember {
            member: member.to_string(),
            score,
        });
        set.sort_by(|a, b| a.score.total_cmp(&b.score));
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>> {
        let inner = self.inner.lock();
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let len = i64::try_from(set.len()).unwrap_or(i64::MAX);
        let norm = |i: i64| -> usize {
            let idx = if i < 0 { len + i } else { i };
            usize::try_from(idx.clamp(0, len)).unwrap_or(0)
        };
        let (a, b) = (norm(start), norm(stop).saturating_add(1).min(set.len()));
        if a >= b {
            return Ok(Vec::new());
        }
        Ok(set[a..b].to_vec())
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64> {
        let removed_members: Vec<String> = self
            .zrange(key, start, stop)
            .await?
            .into_iter()
            .map(|m| m.member)
            .collect();
        let mut inner = self.inner.lock();
        if let Some(set) = inner.zsets.get_mut(key) {
            set.retain(|m| !removed_members.contains(&m.member));
        }
        Ok(removed_members.len() as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .map_or(0, |s| s.len() as u64))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(key.to_string()).or_insert(Entry {
            value:      "0".to_string(),
            expires_at: None,
        });
        let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setex_expires() {
        let kv = MemoryKv::new();
        kv.setex("k", Duration::from_millis(5), "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired() {
        let kv = MemoryKv::new();
        kv.set("schema:oracle", "{}").await.unwrap();
        kv.setex("schema:doris", Duration::from_millis(1), "{}")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let keys = kv.scan_prefix("schema:").await.unwrap();
        assert_eq!(keys, vec!["schema:oracle".to_string()]);
    }

    #[tokio::test]
    async fn zset_rank_operations() {
        let kv = MemoryKv::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            kv.zadd("idx", m, s).await.unwrap();
        }
        assert_eq!(kv.zcard("idx").await.unwrap(), 4);
        // Oldest (lowest score) first.
        let oldest = kv.zrange("idx", 0, 0).await.unwrap();
        assert_eq!(oldest[0].member, "a");
        // Trim the oldest two by rank.
        assert_eq!(kv.zremrangebyrank("idx", 0, 1).await.unwrap(), 2);
        assert_eq!(kv.zcard("idx").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incr_counts_from_zero() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("quota:u:20260801").await.unwrap(), 1);
        assert_eq!(kv.incr("quota:u:20260801").await.unwrap(), 2);
    }
}
