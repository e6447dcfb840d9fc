//! Generic upstream OpenID Connect provider.
//!
//! Extends the OAuth 2.0 delegation with discovery and `id_token`
//! verification: provider metadata comes from the upstream's
//! `/.well-known/openid-configuration`, ID-token signatures are checked
//! against the upstream JWKS with issuer, audience, and nonce bound.
//!
//! Two flows are supported:
//! - authorization code, with `client_secret_post` or `client_secret_basic`
//!   token-endpoint authentication;
//! - implicit `id_token`, delivered through a `form_post` callback.
//!
//! # References
//!
//! - [OpenID Connect Core 1.0](https://openid.net/specs/openid-connect-core-1_0.html)
//! - [OpenID Connect Discovery 1.0](https://openid.net/specs/openid-connect-discovery-1_0.html)

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use aegis_core::{AuthError, AuthResult};

use super::oauth2::Tokenset;
use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_token};
use crate::keys::{Jwk, Jwks};

/// Conversation slot for the in-flight upstream state.
const ADAPTER_SLOT: &str = "adapter";

/// How long an upstream round trip may take, in seconds.
const ADAPTER_TTL: i64 = 600;

/// Upstream provider metadata, as fetched from discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcMetadata {
    /// The upstream issuer identifier.
    pub issuer: String,

    /// The upstream authorization endpoint.
    pub authorization_endpoint: String,

    /// The upstream token endpoint.
    pub token_endpoint: String,

    /// The upstream JWKS document URL.
    pub jwks_uri: String,
}

/// Token-endpoint client authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenEndpointAuth {
    /// Send `client_secret` in the form body.
    #[default]
    ClientSecretPost,

    /// Send credentials as HTTP Basic authentication.
    ClientSecretBasic,
}

/// Which OIDC flow to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OidcFlow {
    /// Authorization-code flow; the ID token arrives in the tokenset.
    #[default]
    Code,

    /// Implicit flow; the ID token arrives directly via `form_post`.
    IdToken,
}

/// Configuration for the generic OIDC provider.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// The upstream issuer URL (discovery base).
    pub issuer: String,

    /// Client ID registered with the upstream.
    pub client_id: String,

    /// Client secret; required for the code flow.
    pub client_secret: Option<String>,

    /// Scopes to request; `openid` is always included.
    pub scopes: Vec<String>,

    /// Extra authorization-request query parameters.
    pub query: HashMap<String, String>,

    /// Token-endpoint authentication method.
    pub auth_method: TokenEndpointAuth,

    /// Flow selection.
    pub flow: OidcFlow,
}

impl OidcConfig {
    /// Creates a code-flow config.
    #[must_use]
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            client_secret: None,
            scopes: Vec::new(),
            query: HashMap::new(),
            auth_method: TokenEndpointAuth::default(),
            flow: OidcFlow::default(),
        }
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets additional scopes (`openid` is implicit).
    #[must_use]
    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Selects HTTP Basic token-endpoint authentication.
    #[must_use]
    pub fn with_basic_auth(mut self) -> Self {
        self.auth_method = TokenEndpointAuth::ClientSecretBasic;
        self
    }

    /// Selects the implicit `id_token` flow.
    #[must_use]
    pub fn with_id_token_flow(mut self) -> Self {
        self.flow = OidcFlow::IdToken;
        self
    }

    fn scope_string(&self) -> String {
        let mut scopes = vec!["openid".to_string()];
        scopes.extend(self.scopes.iter().filter(|s| *s != "openid").cloned());
        scopes.join(" ")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AdapterState {
    state: String,
    nonce: String,
}

/// Generic upstream OpenID Connect delegation.
pub struct OidcProvider {
    kind: String,
    config: OidcConfig,
    http: reqwest::Client,
    metadata: RwLock<Option<OidcMetadata>>,
    jwks: RwLock<Option<Jwks>>,
}

impl OidcProvider {
    /// Creates a provider of kind `"oidc"`.
    #[must_use]
    pub fn new(config: OidcConfig) -> Self {
        Self {
            kind: "oidc".to_string(),
            config,
            http: reqwest::Client::new(),
            metadata: RwLock::new(None),
            jwks: RwLock::new(None),
        }
    }

    /// Overrides the provider kind (for vendor-flavored wrappers).
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Seeds the metadata cache, bypassing discovery.
    #[must_use]
    pub fn with_metadata(mut self, metadata: OidcMetadata) -> Self {
        self.metadata = RwLock::new(Some(metadata));
        self
    }

    /// Seeds the JWKS cache, bypassing the fetch.
    #[must_use]
    pub fn with_jwks(mut self, jwks: Jwks) -> Self {
        self.jwks = RwLock::new(Some(jwks));
        self
    }

    async fn metadata(&self) -> AuthResult<OidcMetadata> {
        if let Some(metadata) = self.metadata.read().await.clone() {
            return Ok(metadata);
        }
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer.trim_end_matches('/')
        );
        debug!(url = %url, "fetching upstream OIDC discovery document");
        let metadata: OidcMetadata = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::server_error(format!("oidc discovery: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::server_error(format!("oidc discovery: {e}")))?;
        *self.metadata.write().await = Some(metadata.clone());
        Ok(metadata)
    }

    async fn jwks(&self) -> AuthResult<Jwks> {
        if let Some(jwks) = self.jwks.read().await.clone() {
            return Ok(jwks);
        }
        let metadata = self.metadata().await?;
        let jwks: Jwks = self
            .http
            .get(&metadata.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream jwks: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream jwks: {e}")))?;
        *self.jwks.write().await = Some(jwks.clone());
        Ok(jwks)
    }

    async fn authorize(&self, ctx: &ProviderContext) -> AuthResult<ProviderResponse> {
        let metadata = self.metadata().await?;
        let state = random_token();
        let nonce = random_token();

        let mut url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| AuthError::server_error(format!("authorization endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &ctx.absolute_url_for("/callback"));
            query.append_pair("state", &state);
            query.append_pair("nonce", &nonce);
            query.append_pair("scope", &self.config.scope_string());
            match self.config.flow {
                OidcFlow::Code => {
                    query.append_pair("response_type", "code");
                }
                OidcFlow::IdToken => {
                    query.append_pair("response_type", "id_token");
                    query.append_pair("response_mode", "form_post");
                }
            }
            for (name, value) in &self.config.query {
                query.append_pair(name, value);
            }
        }

        ctx.set(ADAPTER_SLOT, ADAPTER_TTL, &AdapterState { state, nonce })
            .await?;
        Ok(ProviderResponse::Redirect(url.into()))
    }

    async fn callback(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        if let Some(error) = req.param("error") {
            warn!(provider = ctx.provider_name(), error, "upstream returned error");
            return Err(AuthError::access_denied(error));
        }

        let adapter: AdapterState = ctx
            .get(ADAPTER_SLOT)
            .await?
            .ok_or(AuthError::UnknownState)?;
        let state = req.require("state")?;
        if !bool::from(state.as_bytes().ct_eq(adapter.state.as_bytes())) {
            return Err(AuthError::UnknownState);
        }

        let (claims, tokenset) = match self.config.flow {
            OidcFlow::Code => {
                let code = req.require("code")?;
                let tokenset = self.exchange(code, ctx).await?;
                let id_token = tokenset.id_token.clone().ok_or_else(|| {
                    AuthError::access_denied("upstream tokenset carried no id_token")
                })?;
                let claims = self.verify_id_token(&id_token, &adapter.nonce).await?;
                (claims, Some(tokenset))
            }
            OidcFlow::IdToken => {
                let id_token = req.require("id_token")?;
                let claims = self.verify_id_token(id_token, &adapter.nonce).await?;
                (claims, None)
            }
        };
        ctx.unset(ADAPTER_SLOT).await?;

        Ok(ProviderResponse::Success(json!({
            "id": claims,
            "clientID": self.config.client_id,
            "tokenset": tokenset,
        })))
    }

    async fn exchange(&self, code: &str, ctx: &ProviderContext) -> AuthResult<Tokenset> {
        let metadata = self.metadata().await?;
        let secret = self.config.client_secret.as_deref().ok_or_else(|| {
            AuthError::server_error("oidc code flow requires a client secret")
        })?;

        let redirect_uri = ctx.absolute_url_for("/callback");
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];

        let mut request = self.http.post(&metadata.token_endpoint);
        match self.config.auth_method {
            TokenEndpointAuth::ClientSecretPost => {
                form.push(("client_secret", secret));
            }
            TokenEndpointAuth::ClientSecretBasic => {
                request = request.basic_auth(&self.config.client_id, Some(secret));
            }
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream exchange: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::access_denied("upstream code exchange failed"));
        }
        response
            .json::<Tokenset>()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream tokenset: {e}")))
    }

    /// Verifies an upstream ID token: signature by `kid`, `iss`, `aud`, and
    /// the nonce bound at authorization time.
    async fn verify_id_token(&self, token: &str, nonce: &str) -> AuthResult<Value> {
        let metadata = self.metadata().await?;
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::access_denied(format!("malformed id_token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::access_denied("id_token has no kid"))?;

        let jwks = self.jwks().await?;
        let jwk = jwks
            .keys
            .iter()
            .find(|key| key.kid.as_deref() == Some(kid.as_str()))
            .ok_or_else(|| AuthError::access_denied("id_token kid not in upstream JWKS"))?;

        let (decoding_key, algorithms) = decoding_key_for(jwk)?;
        if !algorithms.contains(&header.alg) {
            return Err(AuthError::access_denied("id_token algorithm mismatch"));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&metadata.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        let decoded = jsonwebtoken::decode::<Value>(token, &decoding_key, &validation)
            .map_err(|e| AuthError::access_denied(format!("id_token validation: {e}")))?;

        match decoded.claims.get("nonce").and_then(Value::as_str) {
            Some(claimed) if bool::from(claimed.as_bytes().ct_eq(nonce.as_bytes())) => {}
            _ => return Err(AuthError::access_denied("id_token nonce mismatch")),
        }
        Ok(decoded.claims)
    }
}

/// Builds a decoding key (and its admissible algorithms) from an upstream JWK.
fn decoding_key_for(jwk: &Jwk) -> AuthResult<(DecodingKey, Vec<Algorithm>)> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_deref()
                .ok_or_else(|| AuthError::access_denied("RSA JWK missing n"))?;
            let e = jwk
                .e
                .as_deref()
                .ok_or_else(|| AuthError::access_denied("RSA JWK missing e"))?;
            let key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| AuthError::access_denied(format!("invalid RSA JWK: {e}")))?;
            Ok((
                key,
                vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
            ))
        }
        "EC" => {
            let x = jwk
                .x
                .as_deref()
                .ok_or_else(|| AuthError::access_denied("EC JWK missing x"))?;
            let y = jwk
                .y
                .as_deref()
                .ok_or_else(|| AuthError::access_denied("EC JWK missing y"))?;
            let key = DecodingKey::from_ec_components(x, y)
                .map_err(|e| AuthError::access_denied(format!("invalid EC JWK: {e}")))?;
            Ok((key, vec![Algorithm::ES256, Algorithm::ES384]))
        }
        other => Err(AuthError::access_denied(format!(
            "unsupported JWK key type {other}"
        ))),
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match req.path.as_str() {
            "authorize" => self.authorize(ctx).await,
            "callback" => self.callback(&req, ctx).await,
            other => Err(AuthError::invalid_request(format!(
                "unknown provider route {other}"
            ))),
        }
    }
}
