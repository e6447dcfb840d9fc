//! Token minting, verification, and refresh-token rotation.
//!
//! Access tokens are ES256 JWTs carrying the subject inline (`type` +
//! `properties`), so relying parties verify without calling home. Refresh
//! tokens are opaque `<subjectID>:<refreshID>:<secret>` strings backed by
//! records under `oauth:refresh/<subjectID>/<refreshID>`.
//!
//! Rotation forms a linked list: consuming a refresh token writes the
//! successor pair onto the consumed record. A replay inside the reuse
//! interval returns that cached pair verbatim (network retries stay
//! idempotent); a replay after the interval is treated as theft, and the
//! whole descendant chain is deleted. Detection is silent: the caller sees
//! only `invalid_grant`.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::{debug, warn};

use aegis_core::{AuthError, AuthResult, Subject, SubjectRegistry};
use aegis_storage::StorageAdapter;

use crate::config::TtlConfig;
use crate::keys::KeyStore;

/// Storage key family for refresh tokens.
const REFRESH_FAMILY: &str = "oauth:refresh";

/// Upper bound on reuse-detection chain walks; a healthy chain is short.
const MAX_CHAIN_WALK: usize = 1024;

// ============================================================================
// Claims and records
// ============================================================================

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer URL.
    pub iss: String,

    /// Subject ID.
    pub sub: String,

    /// Audience: the client the token was minted for.
    pub aud: String,

    /// Expiration, Unix seconds.
    pub exp: i64,

    /// Issued at, Unix seconds.
    pub iat: i64,

    /// Token mode; always `"access"` for access tokens.
    pub mode: String,

    /// Subject type, a key in the issuer's subject registry.
    #[serde(rename = "type")]
    pub subject_type: String,

    /// Schema-validated subject properties.
    pub properties: Value,

    /// Granted scopes, if the grant carried any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

/// Stored refresh-token record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRecord {
    /// Subject type.
    #[serde(rename = "type")]
    pub subject_type: String,

    /// Subject properties as validated at issue time.
    pub properties: Value,

    /// Client the token belongs to.
    pub client_id: String,

    /// The stored secret; compared constant-time on consumption.
    pub secret: String,

    /// Scopes carried by the grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,

    /// Successor refresh token, set when this record has been consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,

    /// Successor access token, cached for idempotent replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_access: Option<String>,

    /// When this record was consumed, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_used: Option<i64>,
}

/// An access/refresh token pair as returned from the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// The signed access token.
    pub access: String,

    /// The opaque refresh token.
    pub refresh: String,

    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

/// The outcome of verifying an access token.
#[derive(Debug, Clone)]
pub struct VerifiedAccess {
    /// The validated subject.
    pub subject: Subject,

    /// The audience the token was minted for.
    pub client_id: String,

    /// Scopes carried by the token.
    pub scopes: Option<Vec<String>>,
}

// ============================================================================
// Token service
// ============================================================================

/// Mints, rotates, and verifies tokens.
pub struct TokenService {
    issuer: String,
    storage: Arc<dyn StorageAdapter>,
    keys: Arc<KeyStore>,
    subjects: SubjectRegistry,
    ttl: TtlConfig,
}

impl TokenService {
    /// Creates a token service.
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        storage: Arc<dyn StorageAdapter>,
        keys: Arc<KeyStore>,
        subjects: SubjectRegistry,
        ttl: TtlConfig,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            storage,
            keys,
            subjects,
            ttl,
        }
    }

    /// The configured TTLs.
    #[must_use]
    pub fn ttl(&self) -> &TtlConfig {
        &self.ttl
    }

    fn refresh_key(subject_id: &str, refresh_id: &str) -> Vec<String> {
        vec![
            REFRESH_FAMILY.to_string(),
            subject_id.to_string(),
            refresh_id.to_string(),
        ]
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    // ------------------------------------------------------------------------
    // Minting
    // ------------------------------------------------------------------------

    /// Mints a signed access token for a subject.
    ///
    /// The subject's properties are re-validated against the registry before
    /// signing; a subject that stops conforming never reaches a token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubject` on schema failure or a server error if
    /// signing fails.
    pub async fn mint_access(
        &self,
        client_id: &str,
        subject: &Subject,
        scopes: Option<&[String]>,
    ) -> AuthResult<String> {
        let properties = self
            .subjects
            .validate(&subject.subject_type, &subject.properties)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;

        let now = Self::now();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: subject.id.clone(),
            aud: client_id.to_string(),
            exp: now + self.ttl.access,
            iat: now,
            mode: "access".to_string(),
            subject_type: subject.subject_type.clone(),
            properties,
            scopes: scopes.map(<[String]>::to_vec),
        };
        self.keys.sign(&claims).await
    }

    /// Mints a refresh token and persists its record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be written.
    pub async fn mint_refresh(
        &self,
        client_id: &str,
        subject: &Subject,
        scopes: Option<&[String]>,
    ) -> AuthResult<String> {
        let refresh_id = uuid::Uuid::new_v4().to_string();
        let secret = generate_secret();

        let record = RefreshRecord {
            subject_type: subject.subject_type.clone(),
            properties: subject.properties.clone(),
            client_id: client_id.to_string(),
            secret: secret.clone(),
            scopes: scopes.map(<[String]>::to_vec),
            next_token: None,
            next_access: None,
            time_used: None,
        };
        self.write_record(&subject.id, &refresh_id, &record, self.ttl.refresh)
            .await?;

        Ok(format!("{}:{}:{}", subject.id, refresh_id, secret))
    }

    /// Mints a full access/refresh pair for a subject.
    ///
    /// # Errors
    ///
    /// Propagates minting and storage errors.
    pub async fn issue(
        &self,
        client_id: &str,
        subject: &Subject,
        scopes: Option<&[String]>,
    ) -> AuthResult<TokenPair> {
        let access = self.mint_access(client_id, subject, scopes).await?;
        let refresh = self.mint_refresh(client_id, subject, scopes).await?;
        Ok(TokenPair {
            access,
            refresh,
            expires_in: self.ttl.access,
        })
    }

    // ------------------------------------------------------------------------
    // Refresh rotation
    // ------------------------------------------------------------------------

    /// Consumes a refresh token, returning the successor pair.
    ///
    /// Behavior per consumption state:
    /// - never consumed: rotate. Mint a successor pair, record it on the
    ///   consumed token, keep the consumed record for the linger window.
    /// - consumed within the reuse interval: return the cached successor
    ///   pair (idempotent replay).
    /// - consumed longer ago: reuse detected. Delete the whole descendant
    ///   chain and fail.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRefreshToken` (surfaced as `invalid_grant`) for
    /// malformed, unknown, or reused tokens.
    pub async fn consume_refresh(&self, token: &str) -> AuthResult<TokenPair> {
        let (subject_id, refresh_id, secret) = parse_refresh_token(token)?;
        let key = Self::refresh_key(subject_id, refresh_id);

        let record: RefreshRecord = aegis_storage::get_json(self.storage.as_ref(), &key)
            .await
            .map_err(|e| AuthError::storage(e.to_string()))?
            .ok_or_else(|| AuthError::invalid_refresh_token("unknown refresh token"))?;

        if !bool::from(secret.as_bytes().ct_eq(record.secret.as_bytes())) {
            return Err(AuthError::invalid_refresh_token("secret mismatch"));
        }

        if let (Some(next_token), Some(time_used)) = (&record.next_token, record.time_used) {
            let elapsed = Self::now() - time_used;
            if elapsed <= self.ttl.reuse {
                debug!(subject = subject_id, "refresh replay within reuse interval");
                let access = record.next_access.clone().ok_or_else(|| {
                    AuthError::invalid_refresh_token("consumed token has no cached successor")
                })?;
                return Ok(TokenPair {
                    access,
                    refresh: next_token.clone(),
                    expires_in: self.ttl.access,
                });
            }

            // Reuse past the interval: treat as theft. Delete every
            // descendant so neither party keeps a working session; tell the
            // caller nothing beyond invalid_grant.
            warn!(subject = subject_id, "refresh token reuse detected");
            self.delete_chain(next_token).await?;
            self.storage
                .remove(&key)
                .await
                .map_err(|e| AuthError::storage(e.to_string()))?;
            return Err(AuthError::invalid_refresh_token("refresh token reused"));
        }

        // First consumption: rotate.
        let subject = Subject::new(
            record.subject_type.clone(),
            subject_id,
            record.properties.clone(),
        );
        let next_access = self
            .mint_access(&record.client_id, &subject, record.scopes.as_deref())
            .await?;
        let next_refresh = self
            .mint_refresh(&record.client_id, &subject, record.scopes.as_deref())
            .await?;

        if self.ttl.rotation_disabled() {
            self.storage
                .remove(&key)
                .await
                .map_err(|e| AuthError::storage(e.to_string()))?;
        } else {
            let consumed = RefreshRecord {
                next_token: Some(next_refresh.clone()),
                next_access: Some(next_access.clone()),
                time_used: Some(Self::now()),
                ..record
            };
            let linger = self.ttl.reuse + self.ttl.retention;
            self.write_record(subject_id, refresh_id, &consumed, linger)
                .await?;
        }

        Ok(TokenPair {
            access: next_access,
            refresh: next_refresh,
            expires_in: self.ttl.access,
        })
    }

    /// Walks `next_token` links forward, deleting every node.
    async fn delete_chain(&self, start: &str) -> AuthResult<()> {
        let mut cursor = Some(start.to_string());
        let mut walked = 0;
        while let Some(token) = cursor.take() {
            walked += 1;
            if walked > MAX_CHAIN_WALK {
                warn!("refresh chain walk exceeded bound, stopping");
                break;
            }
            let Ok((subject_id, refresh_id, _)) = parse_refresh_token(&token) else {
                break;
            };
            let key = Self::refresh_key(subject_id, refresh_id);
            let record: Option<RefreshRecord> =
                aegis_storage::get_json(self.storage.as_ref(), &key)
                    .await
                    .map_err(|e| AuthError::storage(e.to_string()))?;
            self.storage
                .remove(&key)
                .await
                .map_err(|e| AuthError::storage(e.to_string()))?;
            cursor = record.and_then(|record| record.next_token);
        }
        Ok(())
    }

    /// Drops every refresh token for a subject.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan or removals fail.
    pub async fn invalidate(&self, subject_id: &str) -> AuthResult<()> {
        invalidate_subject(self.storage.as_ref(), subject_id).await
    }

    async fn write_record(
        &self,
        subject_id: &str,
        refresh_id: &str,
        record: &RefreshRecord,
        ttl_seconds: i64,
    ) -> AuthResult<()> {
        let ttl = (ttl_seconds > 0).then(|| time::Duration::seconds(ttl_seconds));
        aegis_storage::set_json(
            self.storage.as_ref(),
            &Self::refresh_key(subject_id, refresh_id),
            record,
            ttl,
        )
        .await
        .map_err(|e| AuthError::storage(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Verifies an access token.
    ///
    /// Checks, in order: signature against the `kid`'s key, `iss`, `exp`
    /// (no leeway), `mode == "access"`, `aud` against `expected_audience`
    /// when one is given, and finally the subject schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAccessToken` or `InvalidSubject`.
    pub async fn verify_access(
        &self,
        token: &str,
        expected_audience: Option<&str>,
    ) -> AuthResult<VerifiedAccess> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.validate_aud = false; // checked below against the caller's expectation
        validation.set_required_spec_claims(&["exp", "iss"]);

        let decoded = self
            .keys
            .decode::<AccessClaims>(token, &validation)
            .await?;
        let claims = decoded.claims;

        if claims.mode != "access" {
            return Err(AuthError::invalid_access_token("not an access token"));
        }
        if let Some(expected) = expected_audience {
            if claims.aud != expected {
                return Err(AuthError::invalid_access_token("audience mismatch"));
            }
        }

        let properties = self
            .subjects
            .validate(&claims.subject_type, &claims.properties)
            .map_err(|e| AuthError::invalid_subject(e.to_string()))?;

        Ok(VerifiedAccess {
            subject: Subject::new(claims.subject_type, claims.sub, properties),
            client_id: claims.aud,
            scopes: claims.scopes,
        })
    }
}

/// Drops every refresh token for a subject.
///
/// Used by both the token service and provider contexts (a provider may
/// force a logout after, say, a password change).
///
/// # Errors
///
/// Returns a storage error if the scan or removals fail.
pub async fn invalidate_subject(
    storage: &dyn StorageAdapter,
    subject_id: &str,
) -> AuthResult<()> {
    let prefix = vec![REFRESH_FAMILY.to_string(), subject_id.to_string()];
    let rows = storage
        .scan(&prefix)
        .await
        .map_err(|e| AuthError::storage(e.to_string()))?;
    for (key, _) in rows {
        storage
            .remove(&key)
            .await
            .map_err(|e| AuthError::storage(e.to_string()))?;
    }
    Ok(())
}

/// Splits an opaque refresh token into `(subject_id, refresh_id, secret)`.
///
/// Subject IDs may themselves contain `:`; the refresh ID and secret never
/// do, so the split runs from the right.
fn parse_refresh_token(token: &str) -> AuthResult<(&str, &str, &str)> {
    let mut parts = token.rsplitn(3, ':');
    let secret = parts.next();
    let refresh_id = parts.next();
    let subject_id = parts.next();
    match (subject_id, refresh_id, secret) {
        (Some(subject_id), Some(refresh_id), Some(secret))
            if !subject_id.is_empty() && !refresh_id.is_empty() && !secret.is_empty() =>
        {
            Ok((subject_id, refresh_id, secret))
        }
        _ => Err(AuthError::invalid_refresh_token("malformed refresh token")),
    }
}

/// Generates a 32-byte URL-safe secret.
fn generate_secret() -> String {
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
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct UserProps {
        #[serde(rename = "userID")]
        user_id: String,
    }

    fn subjects() -> SubjectRegistry {
        SubjectRegistry::new().with_schema("user", Arc::new(TypedSchema::<UserProps>::new()))
    }

    fn service_with(storage: Arc<MemoryStorage>, ttl: TtlConfig) -> TokenService {
        let keys = Arc::new(KeyStore::new(storage.clone()));
        TokenService::new("https://auth.test", storage, keys, subjects(), ttl)
    }

    fn service(storage: Arc<MemoryStorage>) -> TokenService {
        service_with(storage, TtlConfig::default())
    }

    fn user() -> Subject {
        Subject::derived("user", json!({"userID": "123"}))
    }

    // ------------------------------------------------------------------------
    // Access tokens
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_mint_and_verify_access() {
        let service = service(Arc::new(MemoryStorage::new()));
        let token = service
            .mint_access("client-1", &user(), Some(&["read".to_string()]))
            .await
            .unwrap();

        let verified = service.verify_access(&token, Some("client-1")).await.unwrap();
        assert_eq!(verified.subject.subject_type, "user");
        assert_eq!(verified.subject.properties, json!({"userID": "123"}));
        assert_eq!(verified.client_id, "client-1");
        assert_eq!(verified.scopes, Some(vec!["read".to_string()]));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_audience() {
        let service = service(Arc::new(MemoryStorage::new()));
        let token = service.mint_access("client-1", &user(), None).await.unwrap();

        assert!(service.verify_access(&token, Some("client-2")).await.is_err());
        // Without an expected audience any audience passes.
        assert!(service.verify_access(&token, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_expired() {
        let storage = Arc::new(MemoryStorage::new());
        let service = service_with(
            storage,
            TtlConfig {
                access: -10,
                ..TtlConfig::default()
            },
        );
        let token = service.mint_access("client-1", &user(), None).await.unwrap();
        let result = service.verify_access(&token, None).await;
        assert!(matches!(result, Err(AuthError::InvalidAccessToken { .. })));
    }

    #[tokio::test]
    async fn test_mint_rejects_nonconforming_subject() {
        let service = service(Arc::new(MemoryStorage::new()));
        let bad = Subject::derived("user", json!({"userID": 42}));
        let result = service.mint_access("client-1", &bad, None).await;
        assert!(matches!(result, Err(AuthError::InvalidSubject { .. })));
    }

    // ------------------------------------------------------------------------
    // Refresh rotation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_refresh_round_trip() {
        let service = service(Arc::new(MemoryStorage::new()));
        let pair = service.issue("client-1", &user(), None).await.unwrap();

        let next = service.consume_refresh(&pair.refresh).await.unwrap();
        assert_ne!(next.refresh, pair.refresh);
        assert!(service.verify_access(&next.access, Some("client-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_within_reuse_interval_is_idempotent() {
        let service = service(Arc::new(MemoryStorage::new()));
        let pair = service.issue("client-1", &user(), None).await.unwrap();

        let first = service.consume_refresh(&pair.refresh).await.unwrap();
        let replay = service.consume_refresh(&pair.refresh).await.unwrap();

        assert_eq!(first.refresh, replay.refresh);
        assert_eq!(first.access, replay.access);
    }

    #[tokio::test]
    async fn test_reuse_after_interval_purges_chain() {
        let storage = Arc::new(MemoryStorage::new());
        let service = service(storage.clone());
        let pair = service.issue("client-1", &user(), None).await.unwrap();

        let next = service.consume_refresh(&pair.refresh).await.unwrap();

        // Backdate the consumption instead of waiting out the interval.
        let (subject_id, refresh_id, _) = parse_refresh_token(&pair.refresh).unwrap();
        let key = TokenService::refresh_key(subject_id, refresh_id);
        let mut record: RefreshRecord = aegis_storage::get_json(storage.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();
        record.time_used = Some(TokenService::now() - 120);
        aegis_storage::set_json(storage.as_ref(), &key, &record, None)
            .await
            .unwrap();

        let result = service.consume_refresh(&pair.refresh).await;
        assert!(matches!(result, Err(AuthError::InvalidRefreshToken { .. })));

        // The descendant is gone too.
        let result = service.consume_refresh(&next.refresh).await;
        assert!(matches!(result, Err(AuthError::InvalidRefreshToken { .. })));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_tokens() {
        let service = service(Arc::new(MemoryStorage::new()));

        assert!(service.consume_refresh("").await.is_err());
        assert!(service.consume_refresh("no-colons").await.is_err());
        assert!(service.consume_refresh("a:b").await.is_err());
        assert!(service.consume_refresh("sub:id:secret").await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let service = service(Arc::new(MemoryStorage::new()));
        let pair = service.issue("client-1", &user(), None).await.unwrap();

        let (subject_id, refresh_id, _) = parse_refresh_token(&pair.refresh).unwrap();
        let forged = format!("{subject_id}:{refresh_id}:{}", generate_secret());
        assert!(service.consume_refresh(&forged).await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_disabled_removes_consumed_record() {
        let storage = Arc::new(MemoryStorage::new());
        let service = service_with(
            storage.clone(),
            TtlConfig {
                reuse: 0,
                retention: 0,
                ..TtlConfig::default()
            },
        );
        let pair = service.issue("client-1", &user(), None).await.unwrap();

        service.consume_refresh(&pair.refresh).await.unwrap();
        // With rotation semantics off the consumed record is gone, so a
        // replay is just an unknown token.
        assert!(service.consume_refresh(&pair.refresh).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_drops_all_subject_tokens() {
        let storage = Arc::new(MemoryStorage::new());
        let service = service(storage.clone());
        let subject = user();
        let pair1 = service.issue("client-1", &subject, None).await.unwrap();
        let pair2 = service.issue("client-2", &subject, None).await.unwrap();

        service.invalidate(&subject.id).await.unwrap();

        assert!(service.consume_refresh(&pair1.refresh).await.is_err());
        assert!(service.consume_refresh(&pair2.refresh).await.is_err());

        // No presence left in the refresh family.
        let rows = storage
            .scan(&[REFRESH_FAMILY.to_string(), subject.id.clone()])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_refresh_token_with_colons_in_subject() {
        let (subject, id, secret) = parse_refresh_token("ns:user:42:rid-1:sec-1").unwrap();
        assert_eq!(subject, "ns:user:42");
        assert_eq!(id, "rid-1");
        assert_eq!(secret, "sec-1");
    }
}
