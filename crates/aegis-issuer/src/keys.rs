//! Signing key management.
//!
//! Keys are ES256 (ECDSA over P-256) pairs, generated lazily on first
//! signing need and persisted under `oauth:key/<id>` so cold starts re-load
//! them. Exactly one key is the active signer: the newest one not marked
//! retired. Older keys stay published in the JWKS until pruned from storage,
//! so tokens minted before a rotation keep verifying.
//!
//! Rotation is out of band: writing a new key record through the storage API
//! makes it eligible to become the signer at the next process start or cache
//! refresh (at most one hour later).
//!
//! # References
//!
//! - [RFC 7517 - JSON Web Key](https://tools.ietf.org/html/rfc7517)
//! - [RFC 7518 - JSON Web Algorithms](https://tools.ietf.org/html/rfc7518)

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use p256::SecretKey as EcSecretKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use aegis_core::{AuthError, AuthResult};
use aegis_storage::StorageAdapter;

/// Storage key family for signing keys.
const KEY_FAMILY: &str = "oauth:key";

/// Minimum interval between cache re-loads from storage.
const REFRESH_INTERVAL: Duration = Duration::hours(1);

pub use aegis_core::jwk::{Jwk, Jwks};

// ============================================================================
// Persisted key records
// ============================================================================

/// The serialized form of a signing key, as stored under `oauth:key/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key ID (`kid` in JWT headers).
    pub id: String,

    /// Signing algorithm; always "ES256".
    pub alg: String,

    /// Creation time, Unix seconds. The newest non-retired key signs.
    pub created_at: i64,

    /// PKCS#8 PEM private key.
    pub private_pem: String,

    /// Retired keys stay in JWKS for verification but never sign.
    #[serde(default)]
    pub retired: bool,
}

/// A loaded signing key with its prepared JWT key material.
pub struct SigningKey {
    /// Key ID.
    pub id: String,

    /// Creation time, Unix seconds.
    pub created_at: i64,

    /// Whether the key is retired from signing.
    pub retired: bool,

    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl SigningKey {
    /// Generates a fresh ES256 key.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or encoding fails.
    pub fn generate() -> AuthResult<(Self, KeyRecord)> {
        let secret = EcSecretKey::random(&mut OsRng);
        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AuthError::server_error(format!("key generation: {e}")))?
            .to_string();

        let record = KeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            alg: "ES256".to_string(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            private_pem,
            retired: false,
        };
        let key = Self::from_record(&record)?;
        Ok((key, record))
    }

    /// Rebuilds a signing key from its persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM or public point is invalid.
    pub fn from_record(record: &KeyRecord) -> AuthResult<Self> {
        let secret = EcSecretKey::from_pkcs8_pem(&record.private_pem)
            .map_err(|e| AuthError::server_error(format!("invalid stored key: {e}")))?;

        let point = secret.public_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| AuthError::server_error("key missing x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| AuthError::server_error("key missing y coordinate"))?;
        let x_b64 = URL_SAFE_NO_PAD.encode(x.as_slice());
        let y_b64 = URL_SAFE_NO_PAD.encode(y.as_slice());

        let encoding_key = EncodingKey::from_ec_pem(record.private_pem.as_bytes())
            .map_err(|e| AuthError::server_error(format!("invalid stored key: {e}")))?;
        let decoding_key = DecodingKey::from_ec_components(&x_b64, &y_b64)
            .map_err(|e| AuthError::server_error(format!("invalid stored key: {e}")))?;

        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: Some(record.id.clone()),
            use_: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
            crv: Some("P-256".to_string()),
            x: Some(x_b64),
            y: Some(y_b64),
            n: None,
            e: None,
        };

        Ok(Self {
            id: record.id.clone(),
            created_at: record.created_at,
            retired: record.retired,
            encoding_key,
            decoding_key,
            jwk,
        })
    }

    /// The public half as a JWK.
    #[must_use]
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// The verification key.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

// ============================================================================
// Key store
// ============================================================================

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, Arc<SigningKey>>,
    signer: Option<Arc<SigningKey>>,
    loaded_at: Option<OffsetDateTime>,
}

impl KeyCache {
    fn stale(&self) -> bool {
        match self.loaded_at {
            None => true,
            Some(loaded_at) => OffsetDateTime::now_utc() - loaded_at >= REFRESH_INTERVAL,
        }
    }
}

/// Storage-backed ES256 key store.
///
/// Thread-safe; cache entries are immutable after insert (a rotation means a
/// new entry, and pruned keys fall out on the next refresh).
pub struct KeyStore {
    storage: Arc<dyn StorageAdapter>,
    cache: RwLock<KeyCache>,
}

impl KeyStore {
    /// Creates a key store over the given storage adapter.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            cache: RwLock::new(KeyCache::default()),
        }
    }

    fn record_key(id: &str) -> Vec<String> {
        vec![KEY_FAMILY.to_string(), id.to_string()]
    }

    /// Re-reads keys from storage, generating the first key if none exist.
    async fn load(&self, force: bool) -> AuthResult<()> {
        {
            let cache = self.cache.read().await;
            if !force && !cache.stale() {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().await;
        if !force && !cache.stale() {
            return Ok(());
        }

        let rows = self
            .storage
            .scan(&[KEY_FAMILY.to_string()])
            .await
            .map_err(|e| AuthError::storage(e.to_string()))?;

        let mut keys = HashMap::new();
        for (_, value) in rows {
            let record: KeyRecord = serde_json::from_value(value)
                .map_err(|e| AuthError::server_error(format!("corrupt key record: {e}")))?;
            let key = Arc::new(SigningKey::from_record(&record)?);
            keys.insert(key.id.clone(), key);
        }

        if keys.is_empty() {
            tracing::info!("no signing keys in storage, generating initial ES256 key");
            let (key, record) = SigningKey::generate()?;
            let value = serde_json::to_value(&record)
                .map_err(|e| AuthError::server_error(e.to_string()))?;
            self.storage
                .set(&Self::record_key(&key.id), value, None)
                .await
                .map_err(|e| AuthError::storage(e.to_string()))?;
            keys.insert(key.id.clone(), Arc::new(key));
        }

        // Newest non-retired key signs; ties break on id for determinism.
        let signer = keys
            .values()
            .filter(|key| !key.retired)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned();

        cache.keys = keys;
        cache.signer = signer;
        cache.loaded_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Returns the active signer, generating one lazily if storage is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or every stored key is retired.
    pub async fn signer(&self) -> AuthResult<Arc<SigningKey>> {
        self.load(false).await?;
        let cache = self.cache.read().await;
        cache
            .signer
            .clone()
            .ok_or_else(|| AuthError::server_error("no active signing key"))
    }

    /// Signs `claims` into a compact JWS with the active key's `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails or no signer is available.
    pub async fn sign<T: Serialize>(&self, claims: &T) -> AuthResult<String> {
        let signer = self.signer().await?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(signer.id.clone());
        jsonwebtoken::encode(&header, claims, &signer.encoding_key)
            .map_err(|e| AuthError::server_error(format!("token signing: {e}")))
    }

    /// Looks up a key by `kid`, refreshing the cache once on a miss.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAccessToken` for unknown key IDs.
    pub async fn find(&self, kid: &str) -> AuthResult<Arc<SigningKey>> {
        self.load(false).await?;
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
        }
        // A rotation elsewhere may have introduced the key since our last
        // load; refresh once before rejecting.
        self.load(true).await?;
        let cache = self.cache.read().await;
        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::invalid_access_token(format!("unknown key id {kid}")))
    }

    /// Decodes and validates a compact JWS against the key named by its
    /// `kid` header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAccessToken` for malformed tokens, unknown key IDs,
    /// or failed validation.
    pub async fn decode<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> AuthResult<TokenData<T>> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::invalid_access_token(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_access_token("token has no kid"))?;
        let key = self.find(&kid).await?;
        jsonwebtoken::decode(token, &key.decoding_key, validation)
            .map_err(|e| AuthError::invalid_access_token(e.to_string()))
    }

    /// The public JWK set.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial key load fails.
    pub async fn jwks(&self) -> AuthResult<Jwks> {
        self.load(false).await?;
        let cache = self.cache.read().await;
        let mut keys: Vec<Jwk> = cache.keys.values().map(|key| key.jwk.clone()).collect();
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        Ok(Jwks { keys })
    }
}
