//! Sign-In with Ethereum (EIP-4361) provider.
//!
//! Issues a per-conversation nonce, validates the signed message's domain,
//! URI, version, and nonce locally, and delegates the actual signature check
//! to an injected [`EthereumRpc`] capability so smart-contract wallets
//! (ERC-1271/ERC-6492) verify the same way as externally owned accounts.
//!
//! # References
//!
//! - [EIP-4361 - Sign-In with Ethereum](https://eips.ethereum.org/EIPS/eip-4361)

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

use aegis_core::{AuthError, AuthResult};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_token};

/// Conversation slot for the outstanding nonce.
const NONCE_SLOT: &str = "nonce";

/// Nonce lifetime in seconds.
const NONCE_TTL: i64 = 300;

/// Verifies Ethereum message signatures, typically through an RPC node.
#[async_trait]
pub trait EthereumRpc: Send + Sync {
    /// Returns `true` if `signature` over `message` is valid for `address`.
    ///
    /// # Errors
    ///
    /// Returns a server error if the verification backend is unreachable.
    async fn verify_message(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> AuthResult<bool>;
}

/// Configuration for the SIWE provider.
#[derive(Debug, Clone)]
pub struct SiweConfig {
    /// The domain the message must be addressed to.
    pub domain: String,

    /// The URI the message must carry.
    pub uri: String,
}

/// Renders the signing page.
pub trait SiweUi: Send + Sync {
    /// The wallet-signing page; scripts build the EIP-4361 message with the
    /// given nonce and post `message`/`signature`/`address` to
    /// `verify_action`.
    fn sign_in(&self, nonce: &str, verify_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}\
             <div id=\"nonce\" data-nonce=\"{nonce}\"></div>\
             <form method=\"post\" action=\"{verify_action}\"></form></body></html>"
        )
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSiweUi;

impl SiweUi for DefaultSiweUi {}

#[derive(Debug, Serialize, Deserialize)]
struct PendingNonce {
    nonce: String,
}

/// The fields parsed out of an EIP-4361 message.
#[derive(Debug, Clone, PartialEq)]
pub struct SiweMessage {
    /// The requesting domain from the preamble line.
    pub domain: String,

    /// The signing address.
    pub address: String,

    /// The `URI:` field.
    pub uri: String,

    /// The `Version:` field.
    pub version: String,

    /// The `Nonce:` field.
    pub nonce: String,
}

impl SiweMessage {
    /// Parses the subset of EIP-4361 this provider validates.
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` for structurally invalid messages.
    pub fn parse(message: &str) -> AuthResult<Self> {
        let malformed = |what: &str| AuthError::access_denied(format!("siwe message: {what}"));

        let mut lines = message.lines();
        let preamble = lines.next().ok_or_else(|| malformed("empty"))?;
        let domain = preamble
            .strip_suffix(" wants you to sign in with your Ethereum account:")
            .ok_or_else(|| malformed("bad preamble"))?
            .to_string();
        let address = lines
            .next()
            .filter(|line| line.starts_with("0x") && line.len() == 42)
            .ok_or_else(|| malformed("bad address"))?
            .to_string();

        let mut uri = None;
        let mut version = None;
        let mut nonce = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("URI: ") {
                uri = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("Version: ") {
                version = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("Nonce: ") {
                nonce = Some(value.to_string());
            }
        }

        Ok(Self {
            domain,
            address,
            uri: uri.ok_or_else(|| malformed("missing URI"))?,
            version: version.ok_or_else(|| malformed("missing version"))?,
            nonce: nonce.ok_or_else(|| malformed("missing nonce"))?,
        })
    }
}

/// Sign-In with Ethereum authentication.
pub struct SiweProvider {
    config: SiweConfig,
    rpc: Arc<dyn EthereumRpc>,
    ui: Arc<dyn SiweUi>,
}

impl SiweProvider {
    /// Creates a SIWE provider over an Ethereum RPC verifier.
    #[must_use]
    pub fn new(config: SiweConfig, rpc: Arc<dyn EthereumRpc>) -> Self {
        Self {
            config,
            rpc,
            ui: Arc::new(DefaultSiweUi),
        }
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn SiweUi>) -> Self {
        self.ui = ui;
        self
    }

    fn validate(&self, message: &SiweMessage, nonce: &str) -> AuthResult<()> {
        if message.domain != self.config.domain {
            return Err(AuthError::access_denied("siwe domain mismatch"));
        }
        if message.uri != self.config.uri {
            return Err(AuthError::access_denied("siwe uri mismatch"));
        }
        if message.version != "1" {
            return Err(AuthError::access_denied("unsupported siwe version"));
        }
        if !bool::from(message.nonce.as_bytes().ct_eq(nonce.as_bytes())) {
            return Err(AuthError::access_denied("siwe nonce mismatch"));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for SiweProvider {
    fn kind(&self) -> &str {
        "siwe"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "authorize") => {
                let nonce = random_token();
                ctx.set(NONCE_SLOT, NONCE_TTL, &PendingNonce { nonce: nonce.clone() })
                    .await?;
                Ok(ProviderResponse::Html(self.ui.sign_in(
                    &nonce,
                    &ctx.url_for("/verify"),
                    None,
                )))
            }

            ("POST", "verify") => {
                let pending: PendingNonce = ctx
                    .get(NONCE_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;

                let raw = req.require("message")?;
                let signature = req.require("signature")?;
                let message = SiweMessage::parse(raw)?;
                self.validate(&message, &pending.nonce)?;

                if !self
                    .rpc
                    .verify_message(&message.address, raw, signature)
                    .await?
                {
                    return Err(AuthError::access_denied("siwe signature invalid"));
                }

                ctx.unset(NONCE_SLOT).await?;
                Ok(ProviderResponse::Success(json!({
                    "address": message.address,
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
    use std::collections::HashMap;

    const ADDRESS: &str = "0x1111111111111111111111111111111111111111";

    struct StaticRpc(bool);

    #[async_trait]
    impl EthereumRpc for StaticRpc {
        async fn verify_message(&self, _: &str, _: &str, _: &str) -> AuthResult<bool> {
            Ok(self.0)
        }
    }

    fn message(domain: &str, nonce: &str) -> String {
        format!(
            "{domain} wants you to sign in with your Ethereum account:\n\
             {ADDRESS}\n\
             \n\
             Sign in to the app\n\
             \n\
             URI: https://auth.test\n\
             Version: 1\n\
             Chain ID: 1\n\
             Nonce: {nonce}\n\
             Issued At: 2026-08-02T00:00:00Z"
        )
    }

    fn provider(valid: bool) -> SiweProvider {
        SiweProvider::new(
            SiweConfig {
                domain: "auth.test".to_string(),
                uri: "https://auth.test".to_string(),
            },
            Arc::new(StaticRpc(valid)),
        )
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new(
            "req-1",
            "siwe",
            "https://auth.test",
            String::new(),
            Arc::new(MemoryStorage::new()),
        )
    }

    fn post(form: &[(&str, &str)]) -> ProviderRequest {
        ProviderRequest {
            method: Method::POST,
            path: "verify".to_string(),
            query: HashMap::new(),
            form: form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    async fn stored_nonce(ctx: &ProviderContext) -> String {
        let pending: PendingNonce = ctx.get(NONCE_SLOT).await.unwrap().unwrap();
        pending.nonce
    }

    #[test]
    fn test_message_parsing() {
        let parsed = SiweMessage::parse(&message("auth.test", "n-1")).unwrap();
        assert_eq!(parsed.domain, "auth.test");
        assert_eq!(parsed.address, ADDRESS);
        assert_eq!(parsed.uri, "https://auth.test");
        assert_eq!(parsed.version, "1");
        assert_eq!(parsed.nonce, "n-1");

        assert!(SiweMessage::parse("not a siwe message").is_err());
    }

    #[tokio::test]
    async fn test_sign_in_round_trip() {
        let provider = provider(true);
        let ctx = ctx();
        provider
            .handle(
                ProviderRequest {
                    method: Method::GET,
                    path: "authorize".to_string(),
                    query: HashMap::new(),
                    form: HashMap::new(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let nonce = stored_nonce(&ctx).await;
        let msg = message("auth.test", &nonce);
        let response = provider
            .handle(post(&[("message", msg.as_str()), ("signature", "0xsig")]), &ctx)
            .await
            .unwrap();
        let ProviderResponse::Success(value) = response else {
            panic!("expected success");
        };
        assert_eq!(value["address"], ADDRESS);
    }

    #[tokio::test]
    async fn test_wrong_domain_rejected() {
        let provider = provider(true);
        let ctx = ctx();
        provider
            .handle(
                ProviderRequest {
                    method: Method::GET,
                    path: "authorize".to_string(),
                    query: HashMap::new(),
                    form: HashMap::new(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let nonce = stored_nonce(&ctx).await;
        let msg = message("evil.test", &nonce);
        let result = provider
            .handle(post(&[("message", msg.as_str()), ("signature", "0xsig")]), &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn test_stale_nonce_rejected() {
        let provider = provider(true);
        let ctx = ctx();
        provider
            .handle(
                ProviderRequest {
                    method: Method::GET,
                    path: "authorize".to_string(),
                    query: HashMap::new(),
                    form: HashMap::new(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let msg = message("auth.test", "stale-nonce");
        let result = provider
            .handle(post(&[("message", msg.as_str()), ("signature", "0xsig")]), &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let provider = provider(false);
        let ctx = ctx();
        provider
            .handle(
                ProviderRequest {
                    method: Method::GET,
                    path: "authorize".to_string(),
                    query: HashMap::new(),
                    form: HashMap::new(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let nonce = stored_nonce(&ctx).await;
        let msg = message("auth.test", &nonce);
        let result = provider
            .handle(post(&[("message", msg.as_str()), ("signature", "0xbad")]), &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::AccessDenied { .. })));
    }
}
