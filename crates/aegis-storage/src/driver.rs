//! Generic flat-KV driver layer.
//!
//! Some backends (filesystems, cloud object/KV stores) expose nothing richer
//! than string-keyed blobs. [`KvDriver`] is that minimal contract, and
//! [`DriverStorage`] adapts any driver into a full [`StorageAdapter`] by
//! storing an envelope that carries the expiry alongside the value.
//!
//! Single-use semantics on this layer are best-effort: `take` is the default
//! get-then-remove, with no backend atomicity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use time::{Duration, OffsetDateTime};

use crate::key::{join_key, key_matches_prefix, split_key};
use crate::{StorageAdapter, StorageError, StorageResult};

/// A flat string-keyed blob store.
///
/// Keys are the joined storage keys (including the control-character
/// separator); drivers that cannot store such keys verbatim are responsible
/// for their own reversible encoding.
#[async_trait]
pub trait KvDriver: Send + Sync {
    /// Reads the blob at `key`.
    async fn read(&self, key: &str) -> StorageResult<Option<String>>;

    /// Writes the blob at `key`.
    async fn write(&self, key: &str, value: String) -> StorageResult<()>;

    /// Deletes the blob at `key`; deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists every stored key.
    async fn list(&self) -> StorageResult<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry: Option<i64>,
}

impl Envelope {
    fn is_live(&self, now: i64) -> bool {
        self.expiry.is_none_or(|expiry| expiry > now)
    }
}

/// Adapts a [`KvDriver`] into a [`StorageAdapter`].
pub struct DriverStorage<D> {
    driver: D,
}

impl<D: KvDriver> DriverStorage<D> {
    /// Wraps a driver.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    async fn read_live(&self, joined: &str) -> StorageResult<Option<Envelope>> {
        match self.driver.read(joined).await? {
            Some(raw) => {
                let envelope: Envelope = serde_json::from_str(&raw)?;
                if envelope.is_live(Self::now()) {
                    Ok(Some(envelope))
                } else {
                    // Lazy delete of the dead entry.
                    self.driver.delete(joined).await?;
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<D: KvDriver> StorageAdapter for DriverStorage<D> {
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let joined = join_key(key);
        Ok(self.read_live(&joined).await?.map(|envelope| envelope.value))
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let joined = join_key(key);
        let envelope = Envelope {
            value,
            expiry: ttl.map(|ttl| Self::now() + ttl.whole_seconds()),
        };
        self.driver
            .write(&joined, serde_json::to_string(&envelope)?)
            .await
    }

    async fn remove(&self, key: &[String]) -> StorageResult<()> {
        self.driver.delete(&join_key(key)).await
    }

    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>> {
        let bare_prefix = join_key(prefix);
        let mut results = Vec::new();
        for joined in self.driver.list().await? {
            if !key_matches_prefix(&joined, &bare_prefix) {
                continue;
            }
            if let Some(envelope) = self.read_live(&joined).await? {
                results.push((split_key(&joined), envelope.value));
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}

// =============================================================================
// Filesystem driver
// =============================================================================

/// Filesystem [`KvDriver`]: one file per key under a root directory.
///
/// File names are the lowercase hex encoding of the key bytes, which keeps
/// arbitrary segment content (and the separator) out of the path namespace.
pub struct FsDriver {
    root: PathBuf,
}

impl FsDriver {
    /// Creates a driver rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", hex_encode(key.as_bytes())))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[async_trait]
impl KvDriver for FsDriver {
    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::backend(e.to_string())),
        }
    }

    async fn write(&self, key: &str, value: String) -> StorageResult<()> {
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::backend(e.to_string())),
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(hex) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some(bytes) = hex_decode(hex) {
                if let Ok(key) = String::from_utf8(bytes) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::key;
    use serde_json::json;

    async fn storage() -> DriverStorage<FsDriver> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "aegis-fs-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        DriverStorage::new(FsDriver::new(dir).await.unwrap())
    }

    #[test]
    fn test_hex_round_trip() {
        let original = format!("oauth:key{}abc", crate::SEPARATOR);
        let encoded = hex_encode(original.as_bytes());
        assert_eq!(hex_decode(&encoded).unwrap(), original.as_bytes());
    }

    #[tokio::test]
    async fn test_fs_round_trip_and_scan() {
        let storage = storage().await;
        storage
            .set(&key(&["oauth:key", "a"]), json!({"k": 1}), None)
            .await
            .unwrap();
        storage
            .set(&key(&["oauth:code", "b"]), json!({"k": 2}), None)
            .await
            .unwrap();

        assert_eq!(
            storage.get(&key(&["oauth:key", "a"])).await.unwrap(),
            Some(json!({"k": 1}))
        );

        let hits = storage.scan(&key(&["oauth:key"])).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, key(&["oauth:key", "a"]));
    }

    #[tokio::test]
    async fn test_fs_expiry() {
        let storage = storage().await;
        let k = key(&["oauth:code", "dead"]);
        storage
            .set(&k, json!(1), Some(Duration::seconds(-1)))
            .await
            .unwrap();
        assert_eq!(storage.get(&k).await.unwrap(), None);
    }
}
