//! Issuer configuration and integration hooks.
//!
//! The issuer itself carries no user database and no scope ontology; what it
//! needs from the embedding application arrives through the hook traits in
//! this module: the `success` mapping from provider results to subjects, the
//! `allow` guard over client/redirect pairs, and (optionally) the provider
//! selection page.

use async_trait::async_trait;
use time::Duration;
use url::Url;

use aegis_core::{AuthError, AuthResult, Subject};

use crate::provider::{ProviderValue, SuccessContext};

/// Token lifetimes, in the spirit of RFC 6749's flexible deployment knobs.
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Access token lifetime in seconds.
    pub access: i64,

    /// Refresh token lifetime in seconds.
    pub refresh: i64,

    /// Reuse interval: how long a consumed refresh token keeps answering
    /// with the cached successor pair (idempotent replay for network
    /// retries).
    pub reuse: i64,

    /// Retention: how long past the reuse interval a consumed token lingers
    /// so that late reuse trips chain deletion. `reuse == retention == 0`
    /// disables rotation semantics entirely.
    pub retention: i64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            access: 30,
            refresh: 60 * 60 * 24 * 30,
            reuse: 60,
            retention: 0,
        }
    }
}

impl TtlConfig {
    /// Access token TTL as a [`Duration`].
    #[must_use]
    pub fn access_duration(&self) -> Duration {
        Duration::seconds(self.access)
    }

    /// Refresh token TTL as a [`Duration`].
    #[must_use]
    pub fn refresh_duration(&self) -> Duration {
        Duration::seconds(self.refresh)
    }

    /// Returns `true` when rotation semantics are disabled.
    #[must_use]
    pub fn rotation_disabled(&self) -> bool {
        self.reuse == 0 && self.retention == 0
    }

    /// How long a consumed refresh record lingers after rotation.
    #[must_use]
    pub fn linger_duration(&self) -> Duration {
        Duration::seconds(self.reuse + self.retention)
    }
}

/// Static issuer configuration.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// The issuer's external URL; appears in `iss` claims and metadata.
    pub issuer: Url,

    /// Reverse-proxy prefix. Stripped from incoming paths by the router
    /// nesting, retained in emitted self-referential URLs.
    pub base_path: String,

    /// Token lifetimes.
    pub ttl: TtlConfig,

    /// Name of the conversation cookie.
    pub cookie_name: String,

    /// Conversation lifetime in seconds (cookie and stored state).
    pub conversation_ttl: i64,
}

impl IssuerConfig {
    /// Creates a configuration for an issuer URL with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `issuer` is not a valid absolute URL.
    pub fn new(issuer: &str) -> AuthResult<Self> {
        let issuer = Url::parse(issuer)
            .map_err(|e| AuthError::server_error(format!("invalid issuer URL: {e}")))?;
        Ok(Self {
            issuer,
            base_path: String::new(),
            ttl: TtlConfig::default(),
            cookie_name: "openauth_state".to_string(),
            conversation_ttl: 600,
        })
    }

    /// The path prefix for self-referential redirects (`basePath` or `/`).
    #[must_use]
    pub fn relative(&self, path: &str) -> String {
        format!("{}{}", self.base_path, path)
    }

    /// An absolute URL under the issuer for metadata documents.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.issuer.as_str().trim_end_matches('/');
        format!("{}{}{}", base, self.base_path, path)
    }

    /// Conversation TTL as a [`Duration`].
    #[must_use]
    pub fn conversation_duration(&self) -> Duration {
        Duration::seconds(self.conversation_ttl)
    }
}

/// Maps a provider's success payload to a subject.
///
/// This is the `success` callback of the issuer: it discriminates on
/// [`ProviderValue::provider`] and produces the subject whose claims end up
/// in minted tokens.
#[async_trait]
pub trait SuccessHook: Send + Sync {
    /// Produces a subject for a completed provider conversation.
    async fn on_success(&self, ctx: SuccessContext, value: ProviderValue) -> AuthResult<Subject>;
}

#[async_trait]
impl<F, Fut> SuccessHook for F
where
    F: Fn(SuccessContext, ProviderValue) -> Fut + Send + Sync,
    Fut: Future<Output = AuthResult<Subject>> + Send,
{
    async fn on_success(&self, ctx: SuccessContext, value: ProviderValue) -> AuthResult<Subject> {
        self(ctx, value).await
    }
}

/// Decides whether a client may send users to a redirect URI.
#[async_trait]
pub trait ClientGuard: Send + Sync {
    /// Returns `true` if `client_id` may use `redirect_uri`.
    async fn allow(&self, client_id: &str, redirect_uri: &str) -> bool;
}

/// Default guard: HTTPS redirects and loopback HTTP are allowed.
///
/// Production deployments register their own guard with a real client
/// registry; this default only keeps tokens off plaintext non-local wires.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClientGuard;

#[async_trait]
impl ClientGuard for DefaultClientGuard {
    async fn allow(&self, _client_id: &str, redirect_uri: &str) -> bool {
        match Url::parse(redirect_uri) {
            Ok(url) => match url.scheme() {
                "https" => true,
                "http" => matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]")),
                _ => false,
            },
            Err(_) => false,
        }
    }
}

/// Renders the provider-selection page when `/authorize` is called without a
/// `provider` parameter and more than one provider is configured.
pub trait SelectRenderer: Send + Sync {
    /// Renders HTML listing the available providers.
    ///
    /// `providers` is a list of `(name, kind)` pairs; links should point at
    /// `{base}/{name}/authorize`.
    fn render(&self, providers: &[(String, String)], base: &str) -> String;
}

/// Minimal built-in selection page.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSelect;

impl SelectRenderer for DefaultSelect {
    fn render(&self, providers: &[(String, String)], base: &str) -> String {
        let mut html = String::from(
            "<!doctype html><html><head><title>Sign in</title></head><body><h1>Sign in</h1><ul>",
        );
        for (name, kind) in providers {
            html.push_str(&format!(
                "<li><a href=\"{base}/{name}/authorize\">Continue with {name} ({kind})</a></li>"
            ));
        }
        html.push_str("</ul></body></html>");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_defaults() {
        let ttl = TtlConfig::default();
        assert_eq!(ttl.access, 30);
        assert_eq!(ttl.refresh, 60 * 60 * 24 * 30);
        assert_eq!(ttl.reuse, 60);
        assert_eq!(ttl.retention, 0);
        assert!(!ttl.rotation_disabled());
    }

    #[test]
    fn test_rotation_disabled() {
        let ttl = TtlConfig {
            reuse: 0,
            retention: 0,
            ..TtlConfig::default()
        };
        assert!(ttl.rotation_disabled());
    }

    #[test]
    fn test_endpoint_urls_respect_base_path() {
        let mut config = IssuerConfig::new("https://auth.example.com").unwrap();
        config.base_path = "/superbasepath".to_string();

        assert_eq!(
            config.endpoint("/authorize"),
            "https://auth.example.com/superbasepath/authorize"
        );
        assert_eq!(config.relative("/google/authorize"), "/superbasepath/google/authorize");
    }

    #[tokio::test]
    async fn test_default_guard() {
        let guard = DefaultClientGuard;
        assert!(guard.allow("c", "https://app.example.com/cb").await);
        assert!(guard.allow("c", "http://localhost:3000/cb").await);
        assert!(!guard.allow("c", "http://app.example.com/cb").await);
        assert!(!guard.allow("c", "not a url").await);
    }
}
