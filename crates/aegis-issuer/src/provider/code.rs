//! Emailed PIN-code provider.
//!
//! Two-step conversation: the user submits their claims (typically an email
//! address), receives an N-digit code out of band, and types it back. Codes
//! are sampled without modulo bias and compared constant-time. Validation
//! failures re-render the entry form inside the conversation; they never
//! surface as OAuth errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::debug;

use aegis_core::{AuthError, AuthResult};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_digits};

/// Conversation slot for the pending code.
const CODE_SLOT: &str = "code";

/// Delivers a generated code to the user.
#[async_trait]
pub trait CodeSender: Send + Sync {
    /// Sends `code` to whoever `claims` describes.
    async fn send(&self, claims: &HashMap<String, String>, code: &str) -> AuthResult<()>;
}

/// Renders the provider's two form steps.
///
/// The default markup is intentionally bare; real deployments bring their
/// own templates.
pub trait CodeUi: Send + Sync {
    /// The claims-entry step (step one).
    fn prompt(&self, submit_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{submit_action}\">\
             <input name=\"email\" type=\"email\" required>\
             <button type=\"submit\">Send code</button></form></body></html>"
        )
    }

    /// The code-entry step (step two).
    fn entry(&self, verify_action: &str, resend_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{verify_action}\">\
             <input name=\"code\" inputmode=\"numeric\" required>\
             <button type=\"submit\">Verify</button></form>\
             <form method=\"post\" action=\"{resend_action}\"><button>Resend</button></form>\
             </body></html>"
        )
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodeUi;

impl CodeUi for DefaultCodeUi {}

/// Configuration for the code provider.
#[derive(Debug, Clone)]
pub struct CodeProviderConfig {
    /// Number of digits in a code.
    pub length: usize,

    /// How long a pending code stays valid, in seconds.
    pub ttl: i64,
}

impl Default for CodeProviderConfig {
    fn default() -> Self {
        Self {
            length: 6,
            ttl: 600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingCode {
    code: String,
    claims: HashMap<String, String>,
}

/// Emailed PIN-code authentication.
pub struct CodeProvider {
    config: CodeProviderConfig,
    sender: Arc<dyn CodeSender>,
    ui: Arc<dyn CodeUi>,
}

impl CodeProvider {
    /// Creates a code provider with the default UI.
    #[must_use]
    pub fn new(sender: Arc<dyn CodeSender>) -> Self {
        Self {
            config: CodeProviderConfig::default(),
            sender,
            ui: Arc::new(DefaultCodeUi),
        }
    }

    /// Overrides the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CodeProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn CodeUi>) -> Self {
        self.ui = ui;
        self
    }

    async fn start(
        &self,
        claims: HashMap<String, String>,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let code = random_digits(self.config.length);
        debug!(provider = ctx.provider_name(), "issuing login code");
        ctx.set(
            CODE_SLOT,
            self.config.ttl,
            &PendingCode {
                code: code.clone(),
                claims: claims.clone(),
            },
        )
        .await?;
        self.sender.send(&claims, &code).await?;
        Ok(ProviderResponse::Html(self.ui.entry(
            &ctx.url_for("/verify"),
            &ctx.url_for("/resend"),
            None,
        )))
    }
}

#[async_trait]
impl Provider for CodeProvider {
    fn kind(&self) -> &str {
        "code"
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
                self.start(req.form.clone(), ctx).await
            }

            ("POST", "resend") => {
                let pending: PendingCode = ctx
                    .get(CODE_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;
                self.start(pending.claims, ctx).await
            }

            ("POST", "verify") => {
                let pending: PendingCode = ctx
                    .get(CODE_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;
                let submitted = req.param("code").unwrap_or_default();
                if bool::from(submitted.as_bytes().ct_eq(pending.code.as_bytes())) {
                    ctx.unset(CODE_SLOT).await?;
                    Ok(ProviderResponse::Success(json!({
                        "claims": pending.claims,
                    })))
                } else {
                    // Wrong code: retry inside the conversation.
                    Ok(ProviderResponse::Html(self.ui.entry(
                        &ctx.url_for("/verify"),
                        &ctx.url_for("/resend"),
                        Some("invalid code"),
                    )))
                }
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

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(HashMap<String, String>, String)>>,
    }

    #[async_trait]
    impl CodeSender for RecordingSender {
        async fn send(&self, claims: &HashMap<String, String>, code: &str) -> AuthResult<()> {
            self.sent
                .lock()
                .await
                .push((claims.clone(), code.to_string()));
            Ok(())
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new(
            "req-1",
            "code",
            "https://auth.test",
            String::new(),
            Arc::new(MemoryStorage::new()),
        )
    }

    fn post(path: &str, form: &[(&str, &str)]) -> ProviderRequest {
        ProviderRequest {
            method: Method::POST,
            path: path.to_string(),
            query: HashMap::new(),
            form: form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_full_code_conversation() {
        let sender = Arc::new(RecordingSender::default());
        let provider = CodeProvider::new(sender.clone());
        let ctx = ctx();

        let response = provider
            .handle(post("submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Html(_)));

        let (claims, code) = sender.sent.lock().await[0].clone();
        assert_eq!(claims["email"], "a@b.com");
        assert_eq!(code.len(), 6);

        let response = provider
            .handle(post("verify", &[("code", code.as_str())]), &ctx)
            .await
            .unwrap();
        let ProviderResponse::Success(value) = response else {
            panic!("expected success");
        };
        assert_eq!(value["claims"]["email"], "a@b.com");
    }

    #[tokio::test]
    async fn test_wrong_code_rerenders_form() {
        let sender = Arc::new(RecordingSender::default());
        let provider = CodeProvider::new(sender);
        let ctx = ctx();

        provider
            .handle(post("submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();
        let response = provider
            .handle(post("verify", &[("code", "000000")]), &ctx)
            .await
            .unwrap();
        let ProviderResponse::Html(html) = response else {
            panic!("expected retry form");
        };
        assert!(html.contains("invalid code"));
    }

    #[tokio::test]
    async fn test_resend_issues_fresh_code() {
        let sender = Arc::new(RecordingSender::default());
        let provider = CodeProvider::new(sender.clone());
        let ctx = ctx();

        provider
            .handle(post("submit", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();
        provider.handle(post("resend", &[]), &ctx).await.unwrap();

        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0["email"], "a@b.com");

        // Only the latest code verifies.
        drop(sent);
        let latest = sender.sent.lock().await[1].1.clone();
        let response = provider
            .handle(post("verify", &[("code", latest.as_str())]), &ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Success(_)));
    }

    #[tokio::test]
    async fn test_verify_without_conversation() {
        let sender = Arc::new(RecordingSender::default());
        let provider = CodeProvider::new(sender);
        let result = provider
            .handle(post("verify", &[("code", "123456")]), &ctx())
            .await;
        assert!(matches!(result, Err(AuthError::UnknownState)));
    }
}
