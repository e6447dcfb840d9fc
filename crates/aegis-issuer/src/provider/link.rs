//! Magic-link provider.
//!
//! Like the code provider, but the secret travels as a URL: the user submits
//! their claims, receives a link by email, and clicking it lands on the
//! GET verification route that terminates the conversation. The link only
//! works in the browser that started the flow, because the conversation is
//! bound to that browser's cookie.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

use aegis_core::{AuthError, AuthResult};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_token};

/// Conversation slot for the pending link token.
const LINK_SLOT: &str = "link";

/// Delivers the magic link to the user.
#[async_trait]
pub trait LinkSender: Send + Sync {
    /// Sends `url` to whoever `claims` describes.
    async fn send(&self, claims: &HashMap<String, String>, url: &str) -> AuthResult<()>;
}

/// Renders the provider's pages.
pub trait LinkUi: Send + Sync {
    /// The claims-entry form.
    fn prompt(&self, submit_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{submit_action}\">\
             <input name=\"email\" type=\"email\" required>\
             <button type=\"submit\">Send link</button></form></body></html>"
        )
    }

    /// The "check your inbox" page.
    fn sent(&self) -> String {
        "<!doctype html><html><body><p>Check your inbox for the sign-in link.</p></body></html>"
            .to_string()
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLinkUi;

impl LinkUi for DefaultLinkUi {}

#[derive(Debug, Serialize, Deserialize)]
struct PendingLink {
    code: String,
    claims: HashMap<String, String>,
}

/// Magic-link authentication.
pub struct LinkProvider {
    ttl: i64,
    sender: Arc<dyn LinkSender>,
    ui: Arc<dyn LinkUi>,
}

impl LinkProvider {
    /// Creates a link provider with the default UI and a 10-minute TTL.
    #[must_use]
    pub fn new(sender: Arc<dyn LinkSender>) -> Self {
        Self {
            ttl: 600,
            sender,
            ui: Arc::new(DefaultLinkUi),
        }
    }

    /// Overrides the link lifetime in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn LinkUi>) -> Self {
        self.ui = ui;
        self
    }
}

#[async_trait]
impl Provider for LinkProvider {
    fn kind(&self) -> &str {
        "link"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "authorize") => Ok(ProviderResponse::Html(
                self.ui.prompt(&ctx.url_for("/submit"), None),
            )),

            ("POST", "submit") => {
                if req.form.is_empty() {
                    return Ok(ProviderResponse::Html(
                        self.ui
                            .prompt(&ctx.url_for("/submit"), Some("enter your email")),
                    ));
                }
                let code = random_token();
                ctx.set(
                    LINK_SLOT,
                    self.ttl,
                    &PendingLink {
                        code: code.clone(),
                        claims: req.form.clone(),
                    },
                )
                .await?;
                let url = format!("{}?code={code}", ctx.absolute_url_for("/callback"));
                self.sender.send(&req.form, &url).await?;
                Ok(ProviderResponse::Html(self.ui.sent()))
            }

            ("GET", "callback") => {
                let pending: PendingLink = ctx
                    .get(LINK_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;
                let code = req.require("code")?;
                if !bool::from(code.as_bytes().ct_eq(pending.code.as_bytes())) {
                    return Err(AuthError::UnknownState);
                }
                ctx.unset(LINK_SLOT).await?;
                Ok(ProviderResponse::Success(json!({
                    "claims": pending.claims,
                })))
            }

            _ => Err(AuthError::invalid_request(format!(
                "unknown provider route {}",
                req.path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_storage::MemoryStorage;
    use axum::http::Method;
    use tokio::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct RecordingSender {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LinkSender for RecordingSender {
        async fn send(&self, _claims: &HashMap<String, String>, url: &str) -> AuthResult<()> {
            self.urls.lock().await.push(url.to_string());
            Ok(())
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new(
            "req-1",
            "link",
            "https://auth.test",
            String::new(),
            Arc::new(MemoryStorage::new()),
        )
    }

    fn req(method: Method, path: &str, params: &[(&str, &str)]) -> ProviderRequest {
        let map: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (query, form) = if method == Method::GET {
            (map, HashMap::new())
        } else {
            (HashMap::new(), map)
        };
        ProviderRequest {
            method,
            path: path.to_string(),
            query,
            form,
        }
    }

    #[tokio::test]
    async fn test_link_round_trip() {
        let sender = Arc::new(RecordingSender::default());
        let provider = LinkProvider::new(sender.clone());
        let ctx = ctx();

        provider
            .handle(req(Method::POST, "submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();

        let url = sender.urls.lock().await[0].clone();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/link/callback");
        let code = parsed
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let response = provider
            .handle(req(Method::GET, "callback", &[("code", code.as_str())]), &ctx)
            .await
            .unwrap();
        let ProviderResponse::Success(value) = response else {
            panic!("expected success");
        };
        assert_eq!(value["claims"]["email"], "a@b.com");
    }

    #[tokio::test]
    async fn test_forged_code_rejected() {
        let sender = Arc::new(RecordingSender::default());
        let provider = LinkProvider::new(sender);
        let ctx = ctx();

        provider
            .handle(req(Method::POST, "submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();
        let result = provider
            .handle(req(Method::GET, "callback", &[("code", "forged")]), &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::UnknownState)));
    }

    #[tokio::test]
    async fn test_callback_in_foreign_browser_fails() {
        let sender = Arc::new(RecordingSender::default());
        let provider = LinkProvider::new(sender.clone());
        let ctx = ctx();

        provider
            .handle(req(Method::POST, "submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();
        let url = sender.urls.lock().await[0].clone();
        let code = Url::parse(&url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        // A different conversation (different cookie) cannot redeem the link.
        let other = ProviderContext::new(
            "req-other",
            "link",
            "https://auth.test",
            String::new(),
            Arc::new(MemoryStorage::new()),
        );
        let result = provider
            .handle(
                req(Method::GET, "callback", &[("code", code.as_str())]),
                &other,
            )
            .await;
        assert!(matches!(result, Err(AuthError::UnknownState)));
    }
}
