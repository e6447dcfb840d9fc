//! The issuer's HTTP surface.
//!
//! [`Issuer`] assembles configuration, storage, keys, subjects, providers,
//! and hooks into an axum [`Router`]:
//!
//! | Path | Method | Purpose |
//! |---|---|---|
//! | `/.well-known/oauth-authorization-server` | GET | issuer metadata |
//! | `/.well-known/openid-configuration` | GET | OIDC mirror |
//! | `/.well-known/jwks.json` | GET | JWKS |
//! | `/authorize` | GET | start a flow |
//! | `/{provider}/*` | GET/POST | provider sub-routes |
//! | `/token` | POST | grant exchange |
//! | `/userinfo` | GET | resolve the bearer subject |
//!
//! With a `basePath` configured the whole surface nests under it, while
//! redirects back to relying parties stay unprefixed.

pub mod authorize;
pub mod provider;
pub mod token;
pub mod userinfo;
pub mod wellknown;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{Json, Router};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use cookie::{Cookie, SameSite};
use serde_json::json;

use aegis_core::{AuthError, AuthResult, SubjectRegistry};
use aegis_storage::StorageAdapter;

use crate::config::{
    ClientGuard, DefaultClientGuard, DefaultSelect, IssuerConfig, SelectRenderer, SuccessHook,
    TtlConfig,
};
use crate::keys::KeyStore;
use crate::provider::{Provider, ProviderContext};
use crate::token::TokenService;

// ============================================================================
// Issuer state
// ============================================================================

pub(crate) struct IssuerInner {
    pub config: IssuerConfig,
    pub storage: Arc<dyn StorageAdapter>,
    pub keys: Arc<KeyStore>,
    pub tokens: TokenService,
    pub subjects: SubjectRegistry,
    pub providers: Vec<(String, Arc<dyn Provider>)>,
    pub success: Arc<dyn SuccessHook>,
    pub allow: Arc<dyn ClientGuard>,
    pub select: Arc<dyn SelectRenderer>,
}

/// Shared state behind every issuer handler.
#[derive(Clone)]
pub struct IssuerState(pub(crate) Arc<IssuerInner>);

impl IssuerState {
    pub(crate) fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.0
            .providers
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, provider)| provider.clone())
    }

    pub(crate) fn provider_context(&self, request_id: &str, provider: &str) -> ProviderContext {
        ProviderContext::new(
            request_id,
            provider,
            self.0.config.issuer.as_str().trim_end_matches('/'),
            self.0.config.base_path.clone(),
            self.0.storage.clone(),
        )
    }
}

// ============================================================================
// Issuer assembly
// ============================================================================

/// A fully assembled identity issuer.
pub struct Issuer {
    state: IssuerState,
}

impl Issuer {
    /// Starts building an issuer.
    #[must_use]
    pub fn builder() -> IssuerBuilder {
        IssuerBuilder::default()
    }

    /// The axum router serving the whole HTTP surface.
    ///
    /// When a `basePath` is configured the routes nest under it, matching a
    /// reverse proxy that forwards the prefixed path unchanged.
    #[must_use]
    pub fn router(&self) -> Router {
        let routes = Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(wellknown::metadata_handler),
            )
            .route(
                "/.well-known/openid-configuration",
                get(wellknown::metadata_handler),
            )
            .route("/.well-known/jwks.json", get(wellknown::jwks_handler))
            .route("/authorize", get(authorize::authorize_handler))
            .route("/token", post(token::token_handler))
            .route("/userinfo", get(userinfo::userinfo_handler))
            .route("/{provider}/{*rest}", any(provider::provider_handler))
            .with_state(self.state.clone());

        let base_path = &self.state.0.config.base_path;
        if base_path.is_empty() {
            routes
        } else {
            Router::new().nest(base_path, routes)
        }
    }

    /// The shared state, for embedding handlers elsewhere.
    #[must_use]
    pub fn state(&self) -> IssuerState {
        self.state.clone()
    }
}

/// Builder for [`Issuer`].
#[derive(Default)]
pub struct IssuerBuilder {
    issuer: Option<String>,
    base_path: String,
    ttl: TtlConfig,
    storage: Option<Arc<dyn StorageAdapter>>,
    subjects: SubjectRegistry,
    providers: Vec<(String, Arc<dyn Provider>)>,
    success: Option<Arc<dyn SuccessHook>>,
    allow: Option<Arc<dyn ClientGuard>>,
    select: Option<Arc<dyn SelectRenderer>>,
}

impl IssuerBuilder {
    /// Sets the issuer's external URL (required).
    #[must_use]
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sets the reverse-proxy base path (e.g. `"/auth"`).
    #[must_use]
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Sets token lifetimes.
    #[must_use]
    pub fn ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the storage adapter (required).
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the subject registry.
    #[must_use]
    pub fn subjects(mut self, subjects: SubjectRegistry) -> Self {
        self.subjects = subjects;
        self
    }

    /// Registers a provider under a name.
    #[must_use]
    pub fn provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.push((name.into(), provider));
        self
    }

    /// Sets the `success` hook mapping provider payloads to subjects
    /// (required).
    #[must_use]
    pub fn success(mut self, success: Arc<dyn SuccessHook>) -> Self {
        self.success = Some(success);
        self
    }

    /// Sets the client/redirect authorization guard.
    #[must_use]
    pub fn allow(mut self, allow: Arc<dyn ClientGuard>) -> Self {
        self.allow = Some(allow);
        self
    }

    /// Sets the provider-selection renderer.
    #[must_use]
    pub fn select(mut self, select: Arc<dyn SelectRenderer>) -> Self {
        self.select = Some(select);
        self
    }

    /// Assembles the issuer.
    ///
    /// # Errors
    ///
    /// Returns an error when required pieces are missing or the issuer URL
    /// is invalid.
    pub fn build(self) -> AuthResult<Issuer> {
        let issuer_url = self
            .issuer
            .ok_or_else(|| AuthError::server_error("issuer URL is required"))?;
        let storage = self
            .storage
            .ok_or_else(|| AuthError::server_error("storage adapter is required"))?;
        let success = self
            .success
            .ok_or_else(|| AuthError::server_error("success hook is required"))?;
        if self.providers.is_empty() {
            return Err(AuthError::server_error("at least one provider is required"));
        }

        let mut config = IssuerConfig::new(&issuer_url)?;
        config.base_path = self.base_path;
        config.ttl = self.ttl;

        let keys = Arc::new(KeyStore::new(storage.clone()));
        let tokens = TokenService::new(
            config.issuer.as_str().trim_end_matches('/'),
            storage.clone(),
            keys.clone(),
            self.subjects.clone(),
            config.ttl.clone(),
        );

        Ok(Issuer {
            state: IssuerState(Arc::new(IssuerInner {
                config,
                storage,
                keys,
                tokens,
                subjects: self.subjects,
                providers: self.providers,
                success,
                allow: self.allow.unwrap_or_else(|| Arc::new(DefaultClientGuard)),
                select: self.select.unwrap_or_else(|| Arc::new(DefaultSelect)),
            })),
        })
    }
}

// ============================================================================
// Shared handler plumbing
// ============================================================================

/// Renders an error as the RFC 6749 §5.2 JSON form.
pub(crate) fn oauth_error_json(err: &AuthError) -> Response {
    let description = if err.is_server_error() {
        // Storage and internal failures carry no detail outward.
        "internal error".to_string()
    } else {
        err.to_string()
    };
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": err.oauth_error_code(),
            "error_description": description,
        })),
    )
        .into_response()
}

/// Reads the conversation ID from the state cookie.
pub(crate) fn read_request_id(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for cookie in Cookie::split_parse(raw.to_string()).flatten() {
        if cookie.name() == cookie_name {
            return Some(cookie.value().to_string());
        }
    }
    None
}

/// Builds the `Set-Cookie` value binding the browser to its conversation.
pub(crate) fn state_cookie(config: &IssuerConfig, request_id: &str) -> String {
    let path = if config.base_path.is_empty() {
        "/".to_string()
    } else {
        config.base_path.clone()
    };
    Cookie::build((config.cookie_name.clone(), request_id.to_string()))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path(path)
        .max_age(cookie::time::Duration::seconds(config.conversation_ttl))
        .build()
        .to_string()
}

/// Builds the `Set-Cookie` value that clears the conversation cookie.
pub(crate) fn clear_state_cookie(config: &IssuerConfig) -> String {
    let path = if config.base_path.is_empty() {
        "/".to_string()
    } else {
        config.base_path.clone()
    };
    Cookie::build((config.cookie_name.clone(), ""))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path(path)
        .max_age(cookie::time::Duration::seconds(0))
        .build()
        .to_string()
}

/// Appends query parameters to a redirect URI.
pub(crate) fn with_query(uri: &str, params: &[(&str, &str)]) -> String {
    match url::Url::parse(uri) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (name, value) in params {
                    query.append_pair(name, value);
                }
            }
            url.into()
        }
        Err(_) => uri.to_string(),
    }
}

/// Appends fragment parameters to a redirect URI (for the `token` flow).
pub(crate) fn with_fragment(uri: &str, params: &[(&str, &str)]) -> String {
    let encoded: String = params
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                name,
                url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{uri}#{encoded}")
}

/// Parses an `application/x-www-form-urlencoded` body.
pub(crate) fn parse_form(body: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str(body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query_appends() {
        let url = with_query("https://app.example.com/cb?keep=1", &[("code", "abc")]);
        assert_eq!(url, "https://app.example.com/cb?keep=1&code=abc");
    }

    #[test]
    fn test_with_fragment_encodes() {
        let url = with_fragment("https://app.example.com/cb", &[("access_token", "a b")]);
        assert_eq!(url, "https://app.example.com/cb#access_token=a+b");
    }

    #[test]
    fn test_cookie_round_trip() {
        let config = IssuerConfig::new("https://auth.test").unwrap();
        let set = state_cookie(&config, "req-1");
        assert!(set.contains("openauth_state=req-1"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains("SameSite=Lax"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=x; openauth_state=req-1".parse().unwrap(),
        );
        assert_eq!(
            read_request_id(&headers, &config.cookie_name),
            Some("req-1".to_string())
        );
    }

    #[test]
    fn test_error_json_hides_server_detail() {
        let response = oauth_error_json(&AuthError::storage("postgres exploded"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_form() {
        let form = parse_form("a=1&b=two%20words");
        assert_eq!(form["a"], "1");
        assert_eq!(form["b"], "two words");
    }
}
