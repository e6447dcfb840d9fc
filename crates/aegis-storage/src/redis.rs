//! Redis storage adapter.
//!
//! Values are JSON strings; expiry uses Redis-native `EX`, so the server
//! handles TTL reaping. `scan` walks `SCAN MATCH` with a glob-escaped
//! prefix pattern, and `take` maps to `GETDEL`, which makes
//! authorization-code consumption atomic on this backend.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use time::Duration;

use crate::key::{join_key, key_matches_prefix, split_key};
use crate::{StorageAdapter, StorageError, StorageResult};

/// Redis-backed storage adapter.
pub struct RedisStorage {
    connection: MultiplexedConnection,
}

impl RedisStorage {
    /// Connects to a Redis server at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = Client::open(url).map_err(|e| StorageError::backend(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(Self { connection })
    }

    /// Wraps an existing multiplexed connection.
    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

/// Escapes glob metacharacters for a `SCAN MATCH` pattern.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StorageAdapter for RedisStorage {
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(join_key(key))
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let mut conn = self.conn();
        let joined = join_key(key);
        let raw = serde_json::to_string(&value)?;
        match ttl {
            Some(ttl) if ttl.whole_seconds() > 0 => {
                let _: () = conn
                    .set_ex(joined, raw, ttl.whole_seconds() as u64)
                    .await
                    .map_err(|e| StorageError::backend(e.to_string()))?;
            }
            Some(_) => {
                // Zero/negative TTL: the entry is born dead.
                let _: () = conn
                    .del(joined)
                    .await
                    .map_err(|e| StorageError::backend(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(joined, raw)
                    .await
                    .map_err(|e| StorageError::backend(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &[String]) -> StorageResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(join_key(key))
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>> {
        let bare_prefix = join_key(prefix);
        let pattern = format!("{}*", escape_glob(&bare_prefix));

        let mut conn = self.conn();
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(pattern)
                .await
                .map_err(|e| StorageError::backend(e.to_string()))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut results = Vec::with_capacity(keys.len());
        let mut conn = self.conn();
        for joined in keys {
            if !key_matches_prefix(&joined, &bare_prefix) {
                continue;
            }
            // The key may expire between SCAN and GET.
            let raw: Option<String> = conn
                .get(&joined)
                .await
                .map_err(|e| StorageError::backend(e.to_string()))?;
            if let Some(raw) = raw {
                results.push((split_key(&joined), serde_json::from_str(&raw)?));
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    async fn take(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get_del(join_key(key))
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("plain"), "plain");
        assert_eq!(escape_glob("a*b"), "a\\*b");
        assert_eq!(escape_glob("a?[x]"), "a\\?\\[x\\]");
    }
}
