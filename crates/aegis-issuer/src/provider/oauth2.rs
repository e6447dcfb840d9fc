//! Generic upstream OAuth 2.0 provider.
//!
//! Drives the authorization-code grant against any upstream: redirects the
//! browser to the upstream authorization endpoint with a random `state`
//! (and, when enabled, a PKCE challenge), accepts the callback in either
//! `query` or `form_post` response mode, exchanges the code, and delivers
//! the upstream tokenset to the issuer's `success` hook.
//!
//! Concrete providers (Google, GitHub, ...) are this provider with their
//! endpoint URLs filled in; the issuer carries no vendor knowledge.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::Url;

use aegis_core::{AuthError, AuthResult, pkce};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_token};

/// Conversation slot for the in-flight upstream state.
const ADAPTER_SLOT: &str = "adapter";

/// How long an upstream round trip may take, in seconds.
const ADAPTER_TTL: i64 = 600;

/// Upstream endpoint URLs.
#[derive(Debug, Clone)]
pub struct Oauth2Endpoints {
    /// The upstream authorization endpoint.
    pub authorization: String,

    /// The upstream token endpoint.
    pub token: String,
}

/// Configuration for the generic OAuth 2.0 provider.
#[derive(Debug, Clone)]
pub struct Oauth2Config {
    /// Client ID registered with the upstream.
    pub client_id: String,

    /// Client secret registered with the upstream.
    pub client_secret: String,

    /// Upstream endpoints.
    pub endpoints: Oauth2Endpoints,

    /// Scopes to request upstream.
    pub scopes: Vec<String>,

    /// Extra query parameters for the authorization redirect
    /// (e.g. `access_type=offline`).
    pub query: HashMap<String, String>,

    /// Send a PKCE challenge upstream.
    pub pkce: bool,

    /// Ask the upstream for `response_mode=form_post`; the callback then
    /// arrives as a POST with `code`/`state` in form fields.
    pub form_post: bool,
}

impl Oauth2Config {
    /// Creates a config with required fields; the rest default off.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        endpoints: Oauth2Endpoints,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            endpoints,
            scopes: Vec::new(),
            query: HashMap::new(),
            pkce: false,
            form_post: false,
        }
    }

    /// Sets the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an extra authorization-request query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Enables PKCE towards the upstream.
    #[must_use]
    pub fn with_pkce(mut self) -> Self {
        self.pkce = true;
        self
    }

    /// Enables the `form_post` response mode.
    #[must_use]
    pub fn with_form_post(mut self) -> Self {
        self.form_post = true;
        self
    }
}

/// The tokenset returned by an upstream token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokenset {
    /// The upstream access token.
    pub access_token: String,

    /// The upstream refresh token, if granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Upstream access-token lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,

    /// The upstream ID token, for OIDC upstreams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Everything else the upstream returned.
    #[serde(flatten)]
    pub raw: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdapterState {
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verifier: Option<String>,
}

/// Generic upstream OAuth 2.0 delegation.
pub struct Oauth2Provider {
    kind: String,
    config: Oauth2Config,
    http: reqwest::Client,
}

impl Oauth2Provider {
    /// Creates a provider of kind `"oauth2"`.
    #[must_use]
    pub fn new(config: Oauth2Config) -> Self {
        Self {
            kind: "oauth2".to_string(),
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Overrides the provider kind (for vendor-flavored wrappers).
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Overrides the HTTP client.
    #[must_use]
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Builds the upstream authorization redirect and stores the state.
    async fn authorize(&self, ctx: &ProviderContext) -> AuthResult<ProviderResponse> {
        let state = random_token();
        let mut adapter = AdapterState {
            state: state.clone(),
            verifier: None,
        };

        let mut url = Url::parse(&self.config.endpoints.authorization)
            .map_err(|e| AuthError::server_error(format!("authorization endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &ctx.absolute_url_for("/callback"));
            query.append_pair("response_type", "code");
            query.append_pair("state", &state);
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
            if self.config.form_post {
                query.append_pair("response_mode", "form_post");
            }
            for (name, value) in &self.config.query {
                query.append_pair(name, value);
            }
            if self.config.pkce {
                let (verifier, challenge) = pkce::generate();
                query.append_pair("code_challenge", &challenge);
                query.append_pair("code_challenge_method", "S256");
                adapter.verifier = Some(verifier);
            }
        }

        ctx.set(ADAPTER_SLOT, ADAPTER_TTL, &adapter).await?;
        debug!(provider = ctx.provider_name(), "redirecting to upstream");
        Ok(ProviderResponse::Redirect(url.into()))
    }

    /// Validates the callback and exchanges the code upstream.
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
        let code = req.require("code")?;

        let tokenset = self.exchange(code, adapter.verifier.as_deref(), ctx).await?;
        ctx.unset(ADAPTER_SLOT).await?;

        Ok(ProviderResponse::Success(json!({
            "tokenset": tokenset,
            "clientID": self.config.client_id,
        })))
    }

    async fn exchange(
        &self,
        code: &str,
        verifier: Option<&str>,
        ctx: &ProviderContext,
    ) -> AuthResult<Tokenset> {
        let redirect_uri = ctx.absolute_url_for("/callback");
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(&self.config.endpoints.token)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream exchange: {e}")))?;

        if !response.status().is_success() {
            warn!(
                provider = ctx.provider_name(),
                status = %response.status(),
                "upstream exchange failed"
            );
            return Err(AuthError::access_denied("upstream code exchange failed"));
        }

        response
            .json::<Tokenset>()
            .await
            .map_err(|e| AuthError::server_error(format!("upstream tokenset: {e}")))
    }
}

#[async_trait]
impl Provider for Oauth2Provider {
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
