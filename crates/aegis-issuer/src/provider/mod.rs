//! The provider plug-in protocol.
//!
//! A provider owns one authentication method: it serves the HTTP routes
//! under its mount point (`/<name>/*`), drives a short-lived conversation
//! across browser round-trips, and finally delivers a normalized success
//! payload to the issuer. The issuer never parses provider payloads; the
//! embedding application's `success` hook discriminates on the provider
//! name.
//!
//! There is no hidden state: each request hands the provider an explicit
//! [`ProviderRequest`] and [`ProviderContext`]. Conversation scratch data
//! lives in storage under `oauth:provider/<request_id>/<slot>`, keyed by the
//! cookie-bound request ID, so anything half-written is reaped by TTL when a
//! browser wanders off.
//!
//! ## Built-in providers
//!
//! - [`oauth2`] - generic upstream OAuth 2.0 delegation
//! - [`oidc`] - upstream OpenID Connect with `id_token` verification
//! - [`code`] - emailed PIN codes
//! - [`link`] - magic links
//! - [`password`] - password login/register/change with a pluggable hasher
//! - [`webauthn`] - passkey assertions
//! - [`siwe`] - Sign-In with Ethereum
//! - [`saml`] - SAML POST-binding assertions

pub mod code;
pub mod link;
pub mod oauth2;
pub mod oidc;
pub mod password;
pub mod saml;
pub mod siwe;
pub mod webauthn;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::Duration;

use aegis_core::subject::derive_subject_id;
use aegis_core::{AuthError, AuthResult, Subject, SubjectRegistry};
use aegis_storage::StorageAdapter;

/// Storage key family for conversation state.
const CONVERSATION_FAMILY: &str = "oauth:provider";

// ============================================================================
// Request / response shapes
// ============================================================================

/// An HTTP request as seen by a provider, relative to its mount point.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// HTTP method.
    pub method: axum::http::Method,

    /// Path within the provider mount, without a leading slash
    /// (e.g. `"authorize"`, `"callback"`).
    pub path: String,

    /// Query parameters.
    pub query: HashMap<String, String>,

    /// Form fields for `application/x-www-form-urlencoded` bodies.
    pub form: HashMap<String, String>,
}

impl ProviderRequest {
    /// Reads a parameter from the query string or the form body.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .or_else(|| self.form.get(name))
            .map(String::as_str)
    }

    /// Reads a required parameter.
    ///
    /// # Errors
    ///
    /// Returns `MissingParameter` when absent.
    pub fn require(&self, name: &str) -> AuthResult<&str> {
        self.param(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::missing_parameter(name))
    }
}

/// What a provider returns for one request.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    /// Render a page and keep the conversation going.
    Html(String),

    /// Redirect the browser (usually to an upstream identity provider).
    Redirect(String),

    /// Return a JSON body and keep the conversation going.
    Json(Value),

    /// Terminate the conversation successfully with a provider payload.
    Success(Value),
}

/// A provider's success payload, tagged with the provider name.
#[derive(Debug, Clone)]
pub struct ProviderValue {
    /// The registered provider name.
    pub provider: String,

    /// The provider-defined payload.
    pub value: Value,
}

/// Input for the `client_credentials` grant dispatch.
#[derive(Debug, Clone)]
pub struct ClientCredentialsInput {
    /// The authenticating client ID.
    pub client_id: String,

    /// The client secret, when presented.
    pub client_secret: Option<String>,

    /// Remaining token-request parameters.
    pub params: HashMap<String, String>,
}

// ============================================================================
// Provider context
// ============================================================================

/// Per-request capabilities handed to a provider.
#[derive(Clone)]
pub struct ProviderContext {
    request_id: String,
    provider_name: String,
    origin: String,
    mount: String,
    storage: Arc<dyn StorageAdapter>,
}

impl ProviderContext {
    /// Creates a context for one provider request.
    ///
    /// `origin` is the issuer's external URL (no trailing slash) and `mount`
    /// the reverse-proxy base path, both used for self-referential URLs.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        provider_name: impl Into<String>,
        origin: impl Into<String>,
        mount: impl Into<String>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            provider_name: provider_name.into(),
            origin: origin.into(),
            mount: mount.into(),
            storage,
        }
    }

    /// The cookie-bound conversation ID.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The name this provider is registered under.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// A redirect target under this provider's mount
    /// (e.g. `url_for("/callback")` → `/base/google/callback`).
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}{}", self.mount, self.provider_name, path)
    }

    /// The absolute form of [`Self::url_for`], for upstream redirect URIs.
    #[must_use]
    pub fn absolute_url_for(&self, path: &str) -> String {
        format!("{}{}", self.origin, self.url_for(path))
    }

    /// The raw storage adapter, for provider-owned data such as password
    /// hashes.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    fn slot_key(&self, slot: &str) -> Vec<String> {
        vec![
            CONVERSATION_FAMILY.to_string(),
            self.request_id.clone(),
            slot.to_string(),
        ]
    }

    /// Writes a conversation slot with a TTL in seconds.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub async fn set<T: Serialize>(&self, slot: &str, ttl_seconds: i64, value: &T) -> AuthResult<()> {
        aegis_storage::set_json(
            self.storage.as_ref(),
            &self.slot_key(slot),
            value,
            Some(Duration::seconds(ttl_seconds)),
        )
        .await
        .map_err(|e| AuthError::storage(e.to_string()))
    }

    /// Reads a conversation slot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or decode fails.
    pub async fn get<T: DeserializeOwned>(&self, slot: &str) -> AuthResult<Option<T>> {
        aegis_storage::get_json(self.storage.as_ref(), &self.slot_key(slot))
            .await
            .map_err(|e| AuthError::storage(e.to_string()))
    }

    /// Clears a conversation slot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the removal fails.
    pub async fn unset(&self, slot: &str) -> AuthResult<()> {
        self.storage
            .remove(&self.slot_key(slot))
            .await
            .map_err(|e| AuthError::storage(e.to_string()))
    }

    /// Drops every refresh token for a subject (forced logout).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan or removals fail.
    pub async fn invalidate(&self, subject_id: &str) -> AuthResult<()> {
        crate::token::invalidate_subject(self.storage.as_ref(), subject_id).await
    }
}

// ============================================================================
// Success context
// ============================================================================

/// Helper handed to the `success` hook for constructing validated subjects.
#[derive(Clone)]
pub struct SuccessContext {
    subjects: SubjectRegistry,
}

impl SuccessContext {
    /// Creates a success context over the issuer's subject registry.
    #[must_use]
    pub fn new(subjects: SubjectRegistry) -> Self {
        Self { subjects }
    }

    /// Builds a subject with an ID derived from its properties.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubject` if the properties fail the registered schema.
    pub fn subject<T: Serialize>(
        &self,
        subject_type: &str,
        properties: T,
    ) -> AuthResult<Subject> {
        let raw = serde_json::to_value(properties)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;
        let validated = self
            .subjects
            .validate(subject_type, &raw)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;
        let id = derive_subject_id(&validated);
        Ok(Subject::new(subject_type, id, validated))
    }

    /// Builds a subject with an explicit ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubject` if the properties fail the registered schema.
    pub fn subject_with_id<T: Serialize>(
        &self,
        subject_type: &str,
        id: &str,
        properties: T,
    ) -> AuthResult<Subject> {
        let raw = serde_json::to_value(properties)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;
        let validated = self
            .subjects
            .validate(subject_type, &raw)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;
        Ok(Subject::new(subject_type, id, validated))
    }
}

// ============================================================================
// The provider trait
// ============================================================================

/// One pluggable authentication method.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider kind (e.g. `"oauth2"`, `"password"`).
    fn kind(&self) -> &str;

    /// Handles one HTTP request under the provider's mount point.
    ///
    /// # Errors
    ///
    /// Errors render back into the provider conversation where possible;
    /// see the issuer's error propagation rules.
    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse>;

    /// Handles a `client_credentials` dispatch for this provider.
    ///
    /// # Errors
    ///
    /// The default rejects the grant.
    async fn client(
        &self,
        _input: ClientCredentialsInput,
        _ctx: &ProviderContext,
    ) -> AuthResult<Value> {
        Err(AuthError::unsupported_grant_type("client_credentials"))
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Generates `n` uniformly random decimal digits.
///
/// Bytes ≥ 250 are rejected before the mod-10 reduction, so every digit is
/// exactly equally likely.
#[must_use]
pub(crate) fn random_digits(n: usize) -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    let mut digits = String::with_capacity(n);
    let mut buffer = [0u8; 64];
    while digits.len() < n {
        rng.fill_bytes(&mut buffer);
        for byte in buffer {
            if byte < 250 {
                digits.push(char::from(b'0' + byte % 10));
                if digits.len() == n {
                    break;
                }
            }
        }
    }
    digits
}

/// Generates a random URL-safe nonce.
#[must_use]
pub(crate) fn random_token() -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::subject::TypedSchema;
    use aegis_storage::MemoryStorage;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct UserProps {
        email: String,
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new(
            "req-1",
            "google",
            "https://auth.test",
            String::new(),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[tokio::test]
    async fn test_conversation_slots() {
        let ctx = ctx();
        ctx.set("state", 60, &json!({"v": 1})).await.unwrap();
        let value: Option<Value> = ctx.get("state").await.unwrap();
        assert_eq!(value, Some(json!({"v": 1})));

        ctx.unset("state").await.unwrap();
        let value: Option<Value> = ctx.get("state").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_slots_are_scoped_by_request_id() {
        let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let a = ProviderContext::new("req-a", "p", "https://auth.test", String::new(), storage.clone());
        let b = ProviderContext::new("req-b", "p", "https://auth.test", String::new(), storage);

        a.set("slot", 60, &json!(1)).await.unwrap();
        let from_b: Option<Value> = b.get("slot").await.unwrap();
        assert_eq!(from_b, None);
    }

    #[test]
    fn test_url_for_includes_mount_and_provider() {
        let ctx = ProviderContext::new(
            "req-1",
            "google",
            "https://auth.test",
            "/base".to_string(),
            Arc::new(MemoryStorage::new()),
        );
        assert_eq!(ctx.url_for("/callback"), "/base/google/callback");
        assert_eq!(
            ctx.absolute_url_for("/callback"),
            "https://auth.test/base/google/callback"
        );
    }

    #[test]
    fn test_success_context_validates() {
        let registry = SubjectRegistry::new()
            .with_schema("user", Arc::new(TypedSchema::<UserProps>::new()));
        let ctx = SuccessContext::new(registry);

        let subject = ctx.subject("user", json!({"email": "a@b.com"})).unwrap();
        assert_eq!(subject.subject_type, "user");
        assert!(!subject.id.is_empty());

        let err = ctx.subject("user", json!({"email": 7}));
        assert!(matches!(err, Err(AuthError::InvalidSubject { .. })));
    }

    #[test]
    fn test_random_digits_shape() {
        let digits = random_digits(6);
        assert_eq!(digits.len(), 6);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(random_digits(16), random_digits(16));
    }

    #[test]
    fn test_provider_request_params() {
        let mut query = HashMap::new();
        query.insert("a".to_string(), "1".to_string());
        let mut form = HashMap::new();
        form.insert("b".to_string(), "2".to_string());

        let req = ProviderRequest {
            method: axum::http::Method::POST,
            path: "verify".to_string(),
            query,
            form,
        };
        assert_eq!(req.param("a"), Some("1"));
        assert_eq!(req.param("b"), Some("2"));
        assert!(req.require("c").is_err());
    }
}
