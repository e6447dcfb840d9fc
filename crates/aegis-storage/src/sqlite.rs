//! Embedded SQL storage adapter over SQLite.
//!
//! Single table `kv (key TEXT PRIMARY KEY, value TEXT, expiry INTEGER)` with
//! expiry as Unix seconds. Expired rows are filtered on read and deleted
//! opportunistically on write. `take` uses `DELETE ... RETURNING`, which
//! makes authorization-code consumption atomic on this backend.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use time::{Duration, OffsetDateTime};

use crate::key::{join_key, key_matches_prefix, split_key};
use crate::{StorageAdapter, StorageError, StorageResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expiry INTEGER
)";

/// SQLite-backed storage adapter.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (and migrates) a SQLite database at `url`.
    ///
    /// Use `sqlite::memory:` for an ephemeral store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        // SQLite serializes writers anyway, and a single connection keeps
        // `sqlite::memory:` pointing at one database instead of one per
        // pooled connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool; the schema must already exist.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    async fn delete_expired(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM kv WHERE expiry IS NOT NULL AND expiry <= ?1")
            .bind(Self::now())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }
}

/// Escapes `%`, `_`, and the escape character itself for a `LIKE` pattern.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let row = sqlx::query(
            "SELECT value FROM kv WHERE key = ?1 AND (expiry IS NULL OR expiry > ?2)",
        )
        .bind(join_key(key))
        .bind(Self::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::backend(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        self.delete_expired().await?;
        let expiry = ttl.map(|ttl| Self::now() + ttl.whole_seconds());
        sqlx::query(
            "INSERT INTO kv (key, value, expiry) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expiry = excluded.expiry",
        )
        .bind(join_key(key))
        .bind(serde_json::to_string(&value)?)
        .bind(expiry)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &[String]) -> StorageResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(join_key(key))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>> {
        let bare_prefix = join_key(prefix);
        let pattern = format!("{}%", escape_like(&bare_prefix));
        let rows = sqlx::query(
            "SELECT key, value FROM kv
             WHERE key LIKE ?1 ESCAPE '\\' AND (expiry IS NULL OR expiry > ?2)
             ORDER BY key",
        )
        .bind(pattern)
        .bind(Self::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::backend(e.to_string()))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let joined: String = row.get(0);
            if !key_matches_prefix(&joined, &bare_prefix) {
                continue;
            }
            let raw: String = row.get(1);
            results.push((split_key(&joined), serde_json::from_str(&raw)?));
        }
        Ok(results)
    }

    async fn take(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let row = sqlx::query(
            "DELETE FROM kv WHERE key = ?1 AND (expiry IS NULL OR expiry > ?2) RETURNING value",
        )
        .bind(join_key(key))
        .bind(Self::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::backend(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::key;
    use serde_json::json;

    async fn storage() -> SqliteStorage {
        SqliteStorage::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let storage = storage().await;
        let k = key(&["oauth:key", "k1"]);

        storage.set(&k, json!({"alg": "ES256"}), None).await.unwrap();
        assert_eq!(
            storage.get(&k).await.unwrap(),
            Some(json!({"alg": "ES256"}))
        );

        storage.remove(&k).await.unwrap();
        assert_eq!(storage.get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_filtering() {
        let storage = storage().await;
        let k = key(&["oauth:code", "dead"]);
        storage
            .set(&k, json!(1), Some(Duration::seconds(-5)))
            .await
            .unwrap();
        assert_eq!(storage.get(&k).await.unwrap(), None);
        assert!(storage.scan(&key(&["oauth:code"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_boundary() {
        let storage = storage().await;
        storage
            .set(&key(&["oauth:refresh", "sub", "a"]), json!(1), None)
            .await
            .unwrap();
        storage
            .set(&key(&["oauth:refresh", "sub2", "a"]), json!(2), None)
            .await
            .unwrap();

        let hits = storage.scan(&key(&["oauth:refresh", "sub"])).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, key(&["oauth:refresh", "sub", "a"]));
    }

    #[tokio::test]
    async fn test_take_returns_then_deletes() {
        let storage = storage().await;
        let k = key(&["oauth:code", "once"]);
        storage.set(&k, json!("x"), None).await.unwrap();

        assert_eq!(storage.take(&k).await.unwrap(), Some(json!("x")));
        assert_eq!(storage.take(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_escapes_like_wildcards() {
        let storage = storage().await;
        storage
            .set(&key(&["family", "a%b", "x"]), json!(1), None)
            .await
            .unwrap();
        storage
            .set(&key(&["family", "aXb", "x"]), json!(2), None)
            .await
            .unwrap();

        let hits = storage.scan(&key(&["family", "a%b"])).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, json!(1));
    }
}
