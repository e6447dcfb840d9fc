//! Single-use authorization codes.
//!
//! Codes live under `oauth:code/<code>` for at most a minute and are
//! consumed with the storage adapter's `take`, so backends with an atomic
//! delete-on-read make double exchange impossible and the rest are
//! best-effort per their documentation.

use serde::{Deserialize, Serialize};
use time::Duration;

use aegis_core::pkce::PkceMethod;
use aegis_core::{AuthError, AuthResult, Subject};
use aegis_storage::StorageAdapter;

/// Storage key family for authorization codes.
const CODE_FAMILY: &str = "oauth:code";

/// Authorization codes are valid for at most this long.
pub const CODE_TTL_SECONDS: i64 = 60;

/// The PKCE binding recorded at authorization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceBinding {
    /// The recorded code challenge.
    pub challenge: String,

    /// The challenge method (S256).
    pub method: PkceMethod,
}

/// The record stored for an issued authorization code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeRecord {
    /// The subject produced by the `success` hook.
    pub subject: Subject,

    /// The client the code was issued to.
    pub client_id: String,

    /// The redirect URI the code was delivered to; must match at exchange.
    pub redirect_uri: String,

    /// PKCE binding, when the authorization request carried a challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<PkceBinding>,

    /// Scopes granted with the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

/// Generates a fresh random authorization code.
#[must_use]
pub fn generate_code() -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_key(code: &str) -> Vec<String> {
    vec![CODE_FAMILY.to_string(), code.to_string()]
}

/// Persists an authorization code record.
///
/// # Errors
///
/// Returns a storage error if the write fails.
pub async fn store_code(
    storage: &dyn StorageAdapter,
    code: &str,
    record: &AuthorizationCodeRecord,
) -> AuthResult<()> {
    aegis_storage::set_json(
        storage,
        &code_key(code),
        record,
        Some(Duration::seconds(CODE_TTL_SECONDS)),
    )
    .await
    .map_err(|e| AuthError::storage(e.to_string()))
}

/// Consumes an authorization code, deleting it on read.
///
/// # Errors
///
/// Returns `InvalidAuthorizationCode` for unknown, expired, or reused codes.
pub async fn take_code(
    storage: &dyn StorageAdapter,
    code: &str,
) -> AuthResult<AuthorizationCodeRecord> {
    aegis_storage::take_json(storage, &code_key(code))
        .await
        .map_err(|e| AuthError::storage(e.to_string()))?
        .ok_or(AuthError::InvalidAuthorizationCode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_storage::MemoryStorage;
    use serde_json::json;

    fn record() -> AuthorizationCodeRecord {
        AuthorizationCodeRecord {
            subject: Subject::new("user", "id-1", json!({"userID": "123"})),
            client_id: "client-1".to_string(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            pkce: None,
            scopes: None,
        }
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let storage = MemoryStorage::new();
        let code = generate_code();
        store_code(&storage, &code, &record()).await.unwrap();

        let taken = take_code(&storage, &code).await.unwrap();
        assert_eq!(taken.client_id, "client-1");

        let reused = take_code(&storage, &code).await;
        assert!(matches!(reused, Err(AuthError::InvalidAuthorizationCode)));
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let storage = MemoryStorage::new();
        let result = take_code(&storage, "nope").await;
        assert!(matches!(result, Err(AuthError::InvalidAuthorizationCode)));
    }

    #[test]
    fn test_generated_codes_are_unique() {
        assert_ne!(generate_code(), generate_code());
    }
}
