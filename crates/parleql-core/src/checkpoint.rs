//! Checkpointer contract and the in-memory reference implementation.
//!
//! The orchestrator persists the full ticket after every node under
//! `thread_id = ticket_id`. Re-entry after an approval (or a clarify call
//! reusing the thread) loads from here. Absence is a cold start, never an
//! error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// A stored checkpoint: opaque serialized ticket state.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Serialized ticket JSON.
    pub state:      String,
    /// Monotonic version, incremented on every put (CAS support).
    pub version:    u64,
    /// Write time, for TTL enforcement.
    pub written_at: Instant,
}

/// The checkpoint store collaborator.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Load the checkpoint for a thread, if one exists and has not expired.
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Persist a checkpoint, replacing any previous one.
    async fn put(&self, thread_id: &str, state: &str) -> Result<()>;

    /// List thread ids with a given prefix, most recently written first.
    async fn list(&self, thread_id_prefix: &str) -> Result<Vec<String>>;

    /// Remove a checkpoint (explicit cancel / cleanup).
    async fn remove(&self, thread_id: &str) -> Result<()>;
}

/// In-memory [`Checkpointer`] with TTL, used in development mode and tests.
pub struct MemoryCheckpointer {
    ttl:   Duration,
    store: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointer {
    /// Create a store whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            store: DashMap::new(),
        }
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        // Clone out of the map first; removing while a shard ref is held
        // would deadlock.
        let entry = self
            .store
            .get(thread_id)
            .map(|e| (e.clone(), e.written_at.elapsed() >= self.ttl));
        match entry {
            Some((checkpoint, false)) => Ok(Some(checkpoint)),
            Some((_, true)) => {
                self.store.remove(thread_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, thread_id: &str, state: &str) -> Result<()> {
        let version = self
            .store
            .get(thread_id)
            .map_or(0, |existing| existing.version)
            + 1;
        self.store.insert(
            thread_id.to_string(),
            Checkpoint {
                state: state.to_string(),
                version,
                written_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn list(&self, thread_id_prefix: &str) -> Result<Vec<String>> {
        let mut entries: Vec<(String, Instant)> = self
            .store
            .iter()
            .filter(|e| e.key().starts_with(thread_id_prefix) && e.written_at.elapsed() < self.ttl)
            .map(|e| (e.key().clone(), e.written_at))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    async fn remove(&self, thread_id: &str) -> Result<()> {
        self.store.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip_with_versions() {
        let store = MemoryCheckpointer::new(Duration::from_secs(60));
        store.put("q_11111111", "{\"a\":1}").await.unwrap();
        store.put("q_11111111", "{\"a\":2}").await.unwrap();
        let cp = store.get("q_11111111").await.unwrap().expect("present");
        assert_eq!(cp.state, "{\"a\":2}");
        assert_eq!(cp.version, 2);
    }

    #[tokio::test]
    async fn expired_checkpoints_read_as_cold_start() {
        let store = MemoryCheckpointer::new(Duration::from_millis(1));
        store.put("q_22222222", "{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get("q_22222222").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = MemoryCheckpointer::new(Duration::from_secs(60));
        store.put("q_aaaaaaaa", "{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.put("q_bbbbbbbb", "{}").await.unwrap();
        let ids = store.list("q_").await.unwrap();
        assert_eq!(ids, vec!["q_bbbbbbbb".to_string(), "q_aaaaaaaa".to_string()]);
    }
}
