//! Subjects and their validation schemas.
//!
//! A subject is the authenticated principal: a tagged record
//! `{ type, id, properties }` where `type` names a schema registered with the
//! issuer and `properties` is a JSON value that schema has validated. The
//! issuer validates on encode (token minting) and the client re-validates on
//! decode, so schema evolution has to stay decode-compatible until every
//! client is upgraded.
//!
//! When no explicit `id` is supplied the subject ID is a deterministic hash
//! of the canonical JSON encoding of `properties`, which keys the
//! refresh-token graph consistently across logins.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors produced by subject schema validation.
#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    /// The subject type has no registered schema.
    #[error("Unknown subject type: {subject_type}")]
    UnknownType {
        /// The unregistered type name.
        subject_type: String,
    },

    /// The properties value failed the schema.
    #[error("Schema validation failed: {message}")]
    Validation {
        /// Description of the schema failure.
        message: String,
    },
}

impl SubjectError {
    /// Creates a new `UnknownType` error.
    #[must_use]
    pub fn unknown_type(subject_type: impl Into<String>) -> Self {
        Self::UnknownType {
            subject_type: subject_type.into(),
        }
    }

    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// The subject type, a key in the issuer's [`SubjectRegistry`].
    #[serde(rename = "type")]
    pub subject_type: String,

    /// Stable subject identifier; keys the refresh-token graph.
    pub id: String,

    /// Schema-validated properties.
    pub properties: Value,
}

impl Subject {
    /// Creates a subject with an explicit ID.
    #[must_use]
    pub fn new(subject_type: impl Into<String>, id: impl Into<String>, properties: Value) -> Self {
        Self {
            subject_type: subject_type.into(),
            id: id.into(),
            properties,
        }
    }

    /// Creates a subject whose ID is derived from its properties.
    ///
    /// The derived ID is the base64url SHA-256 of the canonical JSON encoding
    /// of `properties`, so equal property sets always map to the same ID.
    #[must_use]
    pub fn derived(subject_type: impl Into<String>, properties: Value) -> Self {
        let id = derive_subject_id(&properties);
        Self {
            subject_type: subject_type.into(),
            id,
            properties,
        }
    }
}

/// Derives the deterministic subject ID for a property set.
#[must_use]
pub fn derive_subject_id(properties: &Value) -> String {
    let mut hasher = Sha256::new();
    write_canonical(properties, &mut hasher);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Feeds the canonical encoding of a JSON value into a hasher.
///
/// Object keys are visited in sorted order so semantically equal values hash
/// identically regardless of construction order.
fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"null"),
        Value::Bool(b) => hasher.update(if *b { &b"true"[..] } else { &b"false"[..] }),
        Value::Number(n) => hasher.update(n.to_string().as_bytes()),
        Value::String(s) => {
            hasher.update(b"\"");
            hasher.update(s.as_bytes());
            hasher.update(b"\"");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(b"\"");
                hasher.update(key.as_bytes());
                hasher.update(b"\":");
                write_canonical(&map[key], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
    }
}

/// A validator for one subject type.
///
/// `validate` accepts an untyped JSON value and returns the (possibly
/// normalized) value on success. Any error is treated as `InvalidSubject` by
/// the issuer and client.
pub trait SubjectSchema: Send + Sync {
    /// Validates a properties value against this schema.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError::Validation`] if the value does not conform.
    fn validate(&self, value: &Value) -> Result<Value, SubjectError>;
}

/// A [`SubjectSchema`] backed by a serde-deserializable record type.
///
/// Validation is a deserialize/serialize round trip: unknown fields are
/// tolerated or rejected exactly as `T`'s serde attributes dictate, and the
/// normalized value is what `T` re-serializes to.
pub struct TypedSchema<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    /// Creates a schema for `T`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubjectSchema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<Value, SubjectError> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| SubjectError::validation(e.to_string()))?;
        serde_json::to_value(typed).map_err(|e| SubjectError::validation(e.to_string()))
    }
}

/// Registry mapping subject type names to their schemas.
#[derive(Clone, Default)]
pub struct SubjectRegistry {
    schemas: HashMap<String, Arc<dyn SubjectSchema>>,
}

impl SubjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema under a type name, replacing any previous one.
    #[must_use]
    pub fn with_schema(
        mut self,
        subject_type: impl Into<String>,
        schema: Arc<dyn SubjectSchema>,
    ) -> Self {
        self.schemas.insert(subject_type.into(), schema);
        self
    }

    /// Registers a serde-backed schema under a type name.
    #[must_use]
    pub fn with_type<T>(self, subject_type: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.with_schema(subject_type, Arc::new(TypedSchema::<T>::new()))
    }

    /// Returns the registered type names.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Validates a properties value against the schema for `subject_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError::UnknownType`] for unregistered types and
    /// [`SubjectError::Validation`] when the value does not conform.
    pub fn validate(&self, subject_type: &str, properties: &Value) -> Result<Value, SubjectError> {
        let schema = self
            .schemas
            .get(subject_type)
            .ok_or_else(|| SubjectError::unknown_type(subject_type))?;
        schema.validate(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct UserProps {
        #[serde(rename = "userID")]
        user_id: String,
    }

    fn registry() -> SubjectRegistry {
        SubjectRegistry::new().with_type::<UserProps>("user")
    }

    #[test]
    fn test_validate_conforming_value() {
        let validated = registry()
            .validate("user", &json!({"userID": "123"}))
            .unwrap();
        assert_eq!(validated, json!({"userID": "123"}));
    }

    #[test]
    fn test_validate_rejects_wrong_shape() {
        let result = registry().validate("user", &json!({"userID": 42}));
        assert!(matches!(result, Err(SubjectError::Validation { .. })));
    }

    #[test]
    fn test_validate_unknown_type() {
        let result = registry().validate("machine", &json!({}));
        assert!(matches!(result, Err(SubjectError::UnknownType { .. })));
    }

    #[test]
    fn test_derived_id_is_deterministic() {
        let a = Subject::derived("user", json!({"a": 1, "b": "x"}));
        let b = Subject::derived("user", json!({"b": "x", "a": 1}));
        assert_eq!(a.id, b.id);

        let c = Subject::derived("user", json!({"a": 2, "b": "x"}));
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_derived_id_distinguishes_nesting() {
        let a = derive_subject_id(&json!({"a": {"b": 1}}));
        let b = derive_subject_id(&json!({"a": {"b": 2}}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subject_serde_shape() {
        let subject = Subject::new("user", "id-1", json!({"userID": "123"}));
        let encoded = serde_json::to_value(&subject).unwrap();
        assert_eq!(encoded["type"], "user");
        assert_eq!(encoded["id"], "id-1");
        assert_eq!(encoded["properties"]["userID"], "123");
    }
}
