//! # aegis-storage
//!
//! Hierarchical, TTL-aware key-value storage for the aegis identity issuer.
//!
//! Every flow and credential in the issuer persists through this crate's
//! [`StorageAdapter`] trait: signing keys, authorization codes, the
//! refresh-token graph, provider conversation state, and provider-owned data
//! such as password hashes.
//!
//! Keys are sequences of string segments joined with a reserved control
//! character; scans are prefix scans over the joined form. The encoding is
//! chosen so prefix semantics survive across heterogeneous backends.
//!
//! ## Adapters
//!
//! - [`MemoryStorage`] - in-process maps with lazy expiry
//! - [`SqliteStorage`] - embedded SQL table (feature `sqlite`, default)
//! - [`RedisStorage`] - Redis with native expiry (feature `redis`)
//! - [`DynamoStorage`] - DynamoDB pk/sk split (feature `dynamodb`)
//! - [`DriverStorage`] - adapter over a flat [`KvDriver`] such as [`FsDriver`]

pub mod adapter;
pub mod driver;
pub mod error;
pub mod key;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use adapter::{StorageAdapter, get_json, remove, set_json, take_json};
pub use driver::{DriverStorage, FsDriver, KvDriver};
pub use error::StorageError;
pub use key::{SEPARATOR, join_key, key_matches_prefix, scan_prefix, split_key};
pub use memory::MemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "redis")]
pub use self::redis::RedisStorage;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoStorage;

/// Type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
