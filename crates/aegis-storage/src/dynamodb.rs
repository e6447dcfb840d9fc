//! DynamoDB storage adapter.
//!
//! Keys are split across the table's composite primary key: the first two
//! segments join into the partition key `pk`, the remainder joins into the
//! sort key `sk` (with a `"#"` sentinel when there is no remainder, since
//! DynamoDB forbids empty key attributes). This makes prefix scans
//! expressible as `pk = ...` queries, with `begins_with(sk, ...)` added for
//! prefixes longer than two segments.
//!
//! Scan prefixes shorter than two segments cannot be served: they would
//! require a full-table scan across partitions. Such calls return
//! [`StorageError::UnsupportedScan`]; the issuer's key families all carry at
//! least two segments on their scan paths.
//!
//! Expiry is a numeric `expiry` attribute in Unix seconds. Point the table's
//! native TTL at it; since DynamoDB reaps lazily (hours late), reads filter
//! on the attribute as well.

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use async_trait::async_trait;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::key::{SEPARATOR, join_key, key_matches_prefix, split_key};
use crate::{StorageAdapter, StorageError, StorageResult};

const EMPTY_SORT_KEY: &str = "#";

/// DynamoDB-backed storage adapter.
pub struct DynamoStorage {
    client: Client,
    table: String,
}

impl DynamoStorage {
    /// Wraps an existing DynamoDB client and table.
    ///
    /// The table must have a composite primary key of string attributes
    /// `pk` and `sk`.
    #[must_use]
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Builds a client from the ambient AWS environment.
    pub async fn from_env(table: impl Into<String>) -> Self {
        let config =
            aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table)
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn primary_key(key: &[String]) -> (String, String) {
        let split = key.len().min(2);
        let pk = join_key(&key[..split]);
        let sk = join_key(&key[split..]);
        let sk = if sk.is_empty() {
            EMPTY_SORT_KEY.to_string()
        } else {
            sk
        };
        (pk, sk)
    }

    fn rejoin(pk: &str, sk: &str) -> String {
        if sk == EMPTY_SORT_KEY {
            pk.to_string()
        } else {
            format!("{pk}{SEPARATOR}{sk}")
        }
    }

    fn item_expired(item: &std::collections::HashMap<String, AttributeValue>) -> bool {
        match item.get("expiry").and_then(|v| v.as_n().ok()) {
            Some(raw) => raw
                .parse::<i64>()
                .map(|expiry| expiry <= Self::now())
                .unwrap_or(true),
            None => false,
        }
    }

    fn item_value(
        item: &std::collections::HashMap<String, AttributeValue>,
    ) -> StorageResult<Value> {
        let raw = item
            .get("value")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StorageError::encoding("item missing value attribute"))?;
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl StorageAdapter for DynamoStorage {
    async fn get(&self, key: &[String]) -> StorageResult<Option<Value>> {
        let (pk, sk) = Self::primary_key(key);
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk))
            .key("sk", AttributeValue::S(sk))
            .send()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;

        match output.item {
            Some(item) if !Self::item_expired(&item) => Ok(Some(Self::item_value(&item)?)),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let (pk, sk) = Self::primary_key(key);
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("pk", AttributeValue::S(pk))
            .item("sk", AttributeValue::S(sk))
            .item("value", AttributeValue::S(serde_json::to_string(&value)?));
        if let Some(ttl) = ttl {
            let expiry = Self::now() + ttl.whole_seconds();
            request = request.item("expiry", AttributeValue::N(expiry.to_string()));
        }
        request
            .send()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &[String]) -> StorageResult<()> {
        let (pk, sk) = Self::primary_key(key);
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk))
            .key("sk", AttributeValue::S(sk))
            .send()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, prefix: &[String]) -> StorageResult<Vec<(Vec<String>, Value)>> {
        if prefix.len() < 2 {
            return Err(StorageError::unsupported_scan(
                "DynamoDB scans need at least two key segments to form the partition key",
            ));
        }

        let pk = join_key(&prefix[..2]);
        let sk_prefix = join_key(&prefix[2..]);
        let bare_prefix = join_key(prefix);

        let mut query = self
            .client
            .query()
            .table_name(&self.table)
            .expression_attribute_values(":pk", AttributeValue::S(pk.clone()));
        if sk_prefix.is_empty() {
            query = query.key_condition_expression("pk = :pk");
        } else {
            query = query
                .key_condition_expression("pk = :pk AND begins_with(sk, :sk)")
                .expression_attribute_values(":sk", AttributeValue::S(sk_prefix));
        }

        let mut results = Vec::new();
        let mut exclusive_start_key = None;
        loop {
            let mut page = query.clone();
            if let Some(start) = exclusive_start_key.take() {
                page = page.set_exclusive_start_key(Some(start));
            }
            let output = page
                .send()
                .await
                .map_err(|e| StorageError::backend(e.to_string()))?;

            for item in output.items() {
                if Self::item_expired(item) {
                    continue;
                }
                let sk = item
                    .get("sk")
                    .and_then(|v| v.as_s().ok())
                    .ok_or_else(|| StorageError::encoding("item missing sort key"))?;
                let joined = Self::rejoin(&pk, sk);
                if key_matches_prefix(&joined, &bare_prefix) {
                    results.push((split_key(&joined), Self::item_value(item)?));
                }
            }

            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key),
                _ => break,
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    async fn take(&self, key: &[String]) -> StorageResult<Option<Value>> {
        // ReturnValues=ALL_OLD makes the delete-and-read a single atomic
        // round trip, so single-use codes stay single-use under races.
        let (pk, sk) = Self::primary_key(key);
        let output = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk))
            .key("sk", AttributeValue::S(sk))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;

        match output.attributes {
            Some(item) if !Self::item_expired(&item) => Ok(Some(Self::item_value(&item)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::key;

    #[test]
    fn test_primary_key_split() {
        let (pk, sk) = DynamoStorage::primary_key(&key(&["oauth:refresh", "sub", "id"]));
        assert_eq!(pk, join_key(&key(&["oauth:refresh", "sub"])));
        assert_eq!(sk, "id");
    }

    #[test]
    fn test_primary_key_two_segments_uses_sentinel() {
        let (pk, sk) = DynamoStorage::primary_key(&key(&["oauth:key", "k1"]));
        assert_eq!(pk, join_key(&key(&["oauth:key", "k1"])));
        assert_eq!(sk, EMPTY_SORT_KEY);
    }

    #[test]
    fn test_rejoin_round_trips() {
        let original = key(&["oauth:refresh", "sub", "id", "extra"]);
        let (pk, sk) = DynamoStorage::primary_key(&original);
        assert_eq!(split_key(&DynamoStorage::rejoin(&pk, &sk)), original);

        let short = key(&["oauth:key", "k1"]);
        let (pk, sk) = DynamoStorage::primary_key(&short);
        assert_eq!(split_key(&DynamoStorage::rejoin(&pk, &sk)), short);
    }
}
