//! The storage adapter contract and typed helpers.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::Duration;

use crate::StorageResult;

/// Semantic key-value operations over ordered string-sequence keys.
///
/// Values are opaque JSON. `ttl` is relative seconds; entries past their
/// expiry must be invisible to `get` and `scan`, though adapters may delete
/// them lazily. Each operation is individually atomic; no cross-key
/// transactionality is required of implementations, and the issuer never
/// depends on compare-and-swap.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Reads the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>>;

    /// Writes `value` at `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()>;

    /// Removes the entry at `key`; removing an absent key is not an error.
    async fn remove(&self, key: &[String]) -> StorageResult<()>;

    /// Returns all live entries whose key starts with `prefix` (at a segment
    /// boundary), as `(segments, value)` pairs.
    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>>;

    /// Reads and removes the value at `key` in one operation.
    ///
    /// The default is a non-atomic get-then-remove. Backends with an atomic
    /// primitive (`DELETE ... RETURNING`, `GETDEL`) override this; the issuer
    /// uses it to make authorization codes single-use.
    async fn take(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.remove(key).await?;
        }
        Ok(value)
    }
}

/// Reads and deserializes the value at `key`.
///
/// # Errors
///
/// Returns a storage error if the read fails or the stored JSON does not
/// deserialize into `T`.
pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    key: &[String],
) -> StorageResult<Option<T>> {
    match storage.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serializes and writes `value` at `key`.
///
/// # Errors
///
/// Returns a storage error if serialization or the write fails.
pub async fn set_json<T: Serialize>(
    storage: &dyn StorageAdapter,
    key: &[String],
    value: &T,
    ttl: Option<Duration>,
) -> StorageResult<()> {
    storage.set(key, serde_json::to_value(value)?, ttl).await
}

/// Removes the entry at `key`.
///
/// # Errors
///
/// Returns a storage error if the removal fails.
pub async fn remove(storage: &dyn StorageAdapter, key: &[String]) -> StorageResult<()> {
    storage.remove(key).await
}

/// Reads, deserializes, and removes the value at `key`.
///
/// # Errors
///
/// Returns a storage error if the read/removal fails or the stored JSON does
/// not deserialize into `T`.
pub async fn take_json<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    key: &[String],
) -> StorageResult<Option<T>> {
    match storage.take(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Builds an owned key from string segments.
#[must_use]
pub fn key(segments: &[&str]) -> Vec<String> {
    segments.iter().map(ToString::to_string).collect()
}
