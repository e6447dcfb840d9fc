//! The relying-party client.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use aegis_core::jwk::Jwks;
use aegis_core::{Subject, SubjectRegistry, pkce};

use crate::error::ClientError;
use crate::transport::{ReqwestTransport, Transport};

/// How much access-token lifetime must remain for `refresh` to skip the
/// round trip.
const REFRESH_SKIP_SECONDS: i64 = 30;

/// The well-known document fields the client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnown {
    /// URI of the JWKS endpoint.
    pub jwks_uri: String,

    /// URI of the token endpoint.
    pub token_endpoint: String,

    /// URI of the authorization endpoint.
    pub authorization_endpoint: String,
}

/// Tokens returned by the issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// The access token.
    #[serde(rename = "access_token")]
    pub access: String,

    /// The refresh token.
    #[serde(rename = "refresh_token")]
    pub refresh: String,

    /// Seconds until the access token expires.
    pub expires_in: i64,
}

/// The PKCE/state challenge returned from [`Client::authorize`].
#[derive(Debug, Clone, Default)]
pub struct Challenge {
    /// The `state` parameter sent to the issuer.
    pub state: String,

    /// The PKCE verifier, when PKCE was requested.
    pub verifier: Option<String>,
}

/// Options for [`Client::authorize`].
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Generate a PKCE verifier/challenge pair (for public clients).
    pub pkce: bool,

    /// Skip the provider-selection page by naming a provider.
    pub provider: Option<String>,
}

/// The authorization URL and its challenge material.
#[derive(Debug, Clone)]
pub struct AuthorizeResult {
    /// Where to send the browser.
    pub url: String,

    /// State (and verifier) to hold for the callback.
    pub challenge: Challenge,
}

/// Options for [`Client::verify`].
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Refresh token used to transparently refresh an expired access token.
    pub refresh: Option<String>,

    /// Expected audience; any audience is accepted when unset.
    pub audience: Option<String>,
}

/// The outcome of [`Client::verify`].
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// The validated subject.
    pub subject: Subject,

    /// Fresh tokens, present only when a refresh happened.
    pub tokens: Option<Tokens>,
}

/// A relying-party client bound to one issuer.
pub struct Client {
    client_id: String,
    issuer: String,
    subjects: SubjectRegistry,
    transport: Arc<dyn Transport>,
    wellknown_cache: RwLock<HashMap<String, WellKnown>>,
    jwks_cache: RwLock<HashMap<String, Jwks>>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    client_id: String,
    issuer: String,
    subjects: SubjectRegistry,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Sets the subject registry used to re-validate decoded subjects.
    #[must_use]
    pub fn subjects(mut self, subjects: SubjectRegistry) -> Self {
        self.subjects = subjects;
        self
    }

    /// Overrides the HTTP transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> Client {
        Client {
            client_id: self.client_id,
            issuer: self.issuer.trim_end_matches('/').to_string(),
            subjects: self.subjects,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::default())),
            wellknown_cache: RwLock::new(HashMap::new()),
            jwks_cache: RwLock::new(HashMap::new()),
        }
    }
}

impl Client {
    /// Starts building a client for `client_id` against `issuer`.
    #[must_use]
    pub fn builder(client_id: impl Into<String>, issuer: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            client_id: client_id.into(),
            issuer: issuer.into(),
            subjects: SubjectRegistry::new(),
            transport: None,
        }
    }

    // ------------------------------------------------------------------------
    // Metadata caches
    // ------------------------------------------------------------------------

    async fn wellknown(&self) -> Result<WellKnown, ClientError> {
        if let Some(cached) = self.wellknown_cache.read().await.get(&self.issuer) {
            return Ok(cached.clone());
        }
        let url = format!("{}/.well-known/oauth-authorization-server", self.issuer);
        let response = self.transport.get(&url).await?;
        if !response.is_success() {
            return Err(ClientError::issuer(format!(
                "well-known fetch returned {}",
                response.status
            )));
        }
        let wellknown: WellKnown = response.json()?;
        self.wellknown_cache
            .write()
            .await
            .insert(self.issuer.clone(), wellknown.clone());
        Ok(wellknown)
    }

    async fn jwks(&self, force: bool) -> Result<Jwks, ClientError> {
        let wellknown = self.wellknown().await?;
        if !force {
            if let Some(cached) = self.jwks_cache.read().await.get(&wellknown.jwks_uri) {
                return Ok(cached.clone());
            }
        }
        let response = self.transport.get(&wellknown.jwks_uri).await?;
        if !response.is_success() {
            return Err(ClientError::issuer(format!(
                "jwks fetch returned {}",
                response.status
            )));
        }
        let jwks: Jwks = response.json()?;
        self.jwks_cache
            .write()
            .await
            .insert(wellknown.jwks_uri, jwks.clone());
        Ok(jwks)
    }

    // ------------------------------------------------------------------------
    // Authorize / exchange
    // ------------------------------------------------------------------------

    /// Builds the authorization URL for a redirect URI and response type.
    ///
    /// With `pkce` enabled (and `response_type == "code"`) the result
    /// carries the verifier to present at exchange time.
    ///
    /// # Errors
    ///
    /// Returns an issuer error if the issuer URL does not parse.
    pub fn authorize(
        &self,
        redirect_uri: &str,
        response_type: &str,
        opts: AuthorizeOptions,
    ) -> Result<AuthorizeResult, ClientError> {
        let mut challenge = Challenge {
            state: uuid::Uuid::new_v4().to_string(),
            verifier: None,
        };

        let mut url = url::Url::parse(&format!("{}/authorize", self.issuer))
            .map_err(|e| ClientError::issuer(format!("issuer URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("response_type", response_type);
            query.append_pair("state", &challenge.state);
            if let Some(provider) = &opts.provider {
                query.append_pair("provider", provider);
            }
            if opts.pkce && response_type == "code" {
                let (verifier, code_challenge) = pkce::generate();
                query.append_pair("code_challenge", &code_challenge);
                query.append_pair("code_challenge_method", "S256");
                challenge.verifier = Some(verifier);
            }
        }

        Ok(AuthorizeResult {
            url: url.into(),
            challenge,
        })
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAuthorizationCode` when the issuer rejects the code.
    pub async fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: Option<&str>,
    ) -> Result<Tokens, ClientError> {
        let wellknown = self.wellknown().await?;
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("client_id".to_string(), self.client_id.clone()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier".to_string(), verifier.to_string()));
        }

        let response = self
            .transport
            .post_form(&wellknown.token_endpoint, &form)
            .await?;
        if !response.is_success() {
            debug!(status = response.status, "code exchange rejected");
            return Err(ClientError::InvalidAuthorizationCode);
        }
        response.json()
    }

    /// Refreshes tokens, skipping the round trip while the supplied access
    /// token is still comfortably valid.
    ///
    /// Returns `None` when no refresh was needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRefreshToken` when the issuer rejects the token and
    /// `InvalidAccessToken` when the supplied access token cannot be read.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        access: Option<&str>,
    ) -> Result<Option<Tokens>, ClientError> {
        if let Some(access) = access {
            // No signature check needed just to read exp.
            let claims = insecure_claims(access)?;
            let exp = claims
                .get("exp")
                .and_then(Value::as_i64)
                .ok_or_else(|| ClientError::invalid_access_token("missing exp"))?;
            let now = OffsetDateTime::now_utc().unix_timestamp();
            if exp > now + REFRESH_SKIP_SECONDS {
                return Ok(None);
            }
        }

        let wellknown = self.wellknown().await?;
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        let response = self
            .transport
            .post_form(&wellknown.token_endpoint, &form)
            .await?;
        if !response.is_success() {
            return Err(ClientError::InvalidRefreshToken);
        }
        Ok(Some(response.json()?))
    }

    // ------------------------------------------------------------------------
    // Verify / decode
    // ------------------------------------------------------------------------

    /// Verifies an access token against the issuer's JWKS.
    ///
    /// On expiry, when `opts.refresh` is supplied, the client refreshes once
    /// and verifies the fresh access token; the result then carries the new
    /// token pair.
    ///
    /// # Errors
    ///
    /// Returns `TokenExpired` (when no refresh token was supplied),
    /// `InvalidAccessToken`, `InvalidSubject`, or refresh errors.
    pub async fn verify(
        &self,
        access_token: &str,
        opts: VerifyOptions,
    ) -> Result<VerifyResult, ClientError> {
        match self.verify_local(access_token, opts.audience.as_deref()).await {
            Ok(subject) => Ok(VerifyResult {
                subject,
                tokens: None,
            }),
            Err(ClientError::TokenExpired) if opts.refresh.is_some() => {
                let refresh_token = opts.refresh.as_deref().unwrap_or_default();
                let tokens = self
                    .refresh(refresh_token, None)
                    .await?
                    .ok_or(ClientError::InvalidRefreshToken)?;
                let subject = self
                    .verify_local(&tokens.access, opts.audience.as_deref())
                    .await?;
                Ok(VerifyResult {
                    subject,
                    tokens: Some(tokens),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn verify_local(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<Subject, ClientError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| ClientError::invalid_access_token(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| ClientError::invalid_access_token("token has no kid"))?;

        // A rotation may have published a key since the last fetch; retry
        // once with a forced refresh before failing.
        let jwks = self.jwks(false).await?;
        let jwk = match jwks.find(&kid) {
            Some(jwk) => jwk.clone(),
            None => {
                let jwks = self.jwks(true).await?;
                jwks.find(&kid)
                    .cloned()
                    .ok_or_else(|| ClientError::invalid_access_token("unknown key id"))?
            }
        };

        let (x, y) = match (&jwk.x, &jwk.y) {
            (Some(x), Some(y)) => (x.clone(), y.clone()),
            _ => return Err(ClientError::invalid_access_token("issuer key is not EC")),
        };
        let key = DecodingKey::from_ec_components(&x, &y)
            .map_err(|e| ClientError::invalid_access_token(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss"]);

        let decoded =
            jsonwebtoken::decode::<Value>(token, &key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => ClientError::TokenExpired,
                    _ => ClientError::invalid_access_token(e.to_string()),
                }
            })?;
        let claims = decoded.claims;

        if claims.get("mode").and_then(Value::as_str) != Some("access") {
            return Err(ClientError::invalid_access_token("not an access token"));
        }
        if let Some(expected) = audience {
            if claims.get("aud").and_then(Value::as_str) != Some(expected) {
                return Err(ClientError::invalid_access_token("audience mismatch"));
            }
        }

        self.subject_from_claims(&claims)
    }

    /// Decodes a token's subject without verifying the signature.
    ///
    /// For trusted ingress only, where a verifying proxy already sits in
    /// front; the subject schema still runs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAccessToken` or `InvalidSubject`.
    pub fn decode(&self, token: &str) -> Result<Subject, ClientError> {
        let claims = insecure_claims(token)?;
        self.subject_from_claims(&claims)
    }

    fn subject_from_claims(&self, claims: &Value) -> Result<Subject, ClientError> {
        let sub = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| ClientError::invalid_access_token("missing sub"))?;
        let subject_type = claims
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::invalid_access_token("missing type"))?;
        let properties = claims
            .get("properties")
            .ok_or_else(|| ClientError::invalid_access_token("missing properties"))?;

        let validated = self
            .subjects
            .validate(subject_type, properties)
            .map_err(|e| ClientError::invalid_subject(e.to_string()))?;
        Ok(Subject::new(subject_type, sub, validated))
    }
}

/// Reads a JWT's claims without any signature verification.
fn insecure_claims(token: &str) -> Result<Value, ClientError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ClientError::invalid_access_token("not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| ClientError::invalid_access_token("payload is not base64url"))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| ClientError::invalid_access_token("payload is not JSON"))
}
