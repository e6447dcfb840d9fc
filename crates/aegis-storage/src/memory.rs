//! In-memory storage adapter.
//!
//! Backed by an ordered map so prefix scans are range queries. Expiry is
//! lazy: reads skip dead entries, and every write sweeps a handful of
//! expired neighbors to bound growth in long-lived processes.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::key::{join_key, key_matches_prefix, split_key};
use crate::{StorageAdapter, StorageResult};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expiry: Option<OffsetDateTime>,
}

impl Entry {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_none_or(|expiry| expiry > now)
    }
}

/// In-process storage adapter for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes up to `limit` expired entries.
    async fn sweep(&self, limit: usize) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        let dead: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let joined = join_key(key);
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&joined)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        self.sweep(16).await;
        let joined = join_key(key);
        let expiry = ttl.map(|ttl| OffsetDateTime::now_utc() + ttl);
        let mut entries = self.entries.write().await;
        entries.insert(joined, Entry { value, expiry });
        Ok(())
    }

    async fn remove(&self, key: &[String]) -> StorageResult<()> {
        let joined = join_key(key);
        let mut entries = self.entries.write().await;
        entries.remove(&joined);
        Ok(())
    }

    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>> {
        let bare_prefix = join_key(prefix);
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.read().await;

        // All keys sharing a string prefix are contiguous in the ordered map.
        let results = entries
            .range::<String, _>((Bound::Included(&bare_prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&bare_prefix))
            .filter(|(key, entry)| entry.is_live(now) && key_matches_prefix(key, &bare_prefix))
            .map(|(key, entry)| (split_key(key), entry.value.clone()))
            .collect();
        Ok(results)
    }

    async fn take(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let joined = join_key(key);
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&joined)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }
}
