//! WebAuthn (passkey) provider.
//!
//! Issues a fresh random challenge per attempt and verifies the signed
//! assertion against a caller-supplied P-256 public key. The verification
//! checks, in order: client data type, challenge binding, origin (and
//! `crossOrigin` when present), the `rpIdHash`, the user-present and
//! user-verified flags, and finally the ECDSA signature over
//! `authenticatorData ‖ SHA-256(clientDataJSON)`.
//!
//! Credential registration and storage of public keys is the embedding
//! application's concern; the assertion form carries the key to verify
//! against.
//!
//! # References
//!
//! - [WebAuthn Level 2 §7.2 - Verifying an Authentication Assertion](https://www.w3.org/TR/webauthn-2/#sctn-verifying-assertion)

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use aegis_core::{AuthError, AuthResult};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_digits};

/// Conversation slot for the outstanding challenge.
const CHALLENGE_SLOT: &str = "challenge";

/// Challenge lifetime in seconds.
const CHALLENGE_TTL: i64 = 300;

/// Number of digits in a generated challenge.
const CHALLENGE_DIGITS: usize = 32;

/// Authenticator-data flag: user present.
const FLAG_UP: u8 = 1 << 0;

/// Authenticator-data flag: user verified.
const FLAG_UV: u8 = 1 << 2;

/// Configuration for the WebAuthn provider.
#[derive(Debug, Clone)]
pub struct WebauthnConfig {
    /// The relying-party ID (a registrable domain, e.g. `auth.example.com`).
    pub rp_id: String,

    /// The expected web origin (e.g. `https://auth.example.com`).
    pub origin: String,

    /// Require the user-verified flag in addition to user-present.
    pub require_user_verification: bool,
}

/// Renders the assertion page.
pub trait WebauthnUi: Send + Sync {
    /// The ceremony page; scripts read the challenge and post the assertion
    /// fields to `verify_action`.
    fn ceremony(&self, challenge: &str, verify_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}\
             <div id=\"challenge\" data-challenge=\"{challenge}\"></div>\
             <form method=\"post\" action=\"{verify_action}\"></form></body></html>"
        )
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWebauthnUi;

impl WebauthnUi for DefaultWebauthnUi {}

#[derive(Debug, Serialize, Deserialize)]
struct PendingChallenge {
    challenge: String,
}

/// The collected client data fields the verification inspects.
#[derive(Debug, Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    type_: String,
    challenge: String,
    origin: String,
    #[serde(rename = "crossOrigin", default)]
    cross_origin: Option<bool>,
}

/// Passkey assertion authentication.
pub struct WebauthnProvider {
    config: WebauthnConfig,
    ui: Arc<dyn WebauthnUi>,
}

impl WebauthnProvider {
    /// Creates a WebAuthn provider.
    #[must_use]
    pub fn new(config: WebauthnConfig) -> Self {
        Self {
            config,
            ui: Arc::new(DefaultWebauthnUi),
        }
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn WebauthnUi>) -> Self {
        self.ui = ui;
        self
    }

    /// Verifies one assertion against the supplied public key.
    fn verify_assertion(
        &self,
        challenge: &str,
        public_key_sec1: &[u8],
        authenticator_data: &[u8],
        client_data_json: &[u8],
        signature_der: &[u8],
    ) -> AuthResult<()> {
        let denied = |message: &str| AuthError::access_denied(format!("assertion: {message}"));

        let client_data: ClientData = serde_json::from_slice(client_data_json)
            .map_err(|_| denied("malformed client data"))?;
        if client_data.type_ != "webauthn.get" {
            return Err(denied("wrong client data type"));
        }

        // The browser echoes the challenge base64url-encoded.
        let expected = URL_SAFE_NO_PAD.encode(challenge.as_bytes());
        if !bool::from(client_data.challenge.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(denied("challenge mismatch"));
        }
        if client_data.origin != self.config.origin {
            return Err(denied("origin mismatch"));
        }
        if client_data.cross_origin == Some(true) {
            return Err(denied("cross-origin assertion"));
        }

        if authenticator_data.len() < 37 {
            return Err(denied("authenticator data too short"));
        }
        let rp_id_hash = Sha256::digest(self.config.rp_id.as_bytes());
        if !bool::from(authenticator_data[..32].ct_eq(rp_id_hash.as_slice())) {
            return Err(denied("rpIdHash mismatch"));
        }
        let flags = authenticator_data[32];
        if flags & FLAG_UP == 0 {
            return Err(denied("user not present"));
        }
        if self.config.require_user_verification && flags & FLAG_UV == 0 {
            return Err(denied("user not verified"));
        }

        let key = VerifyingKey::from_sec1_bytes(public_key_sec1)
            .map_err(|_| denied("invalid public key"))?;
        let signature =
            Signature::from_der(signature_der).map_err(|_| denied("invalid signature encoding"))?;

        // signed = authenticatorData ‖ SHA-256(clientDataJSON)
        let client_data_hash = Sha256::digest(client_data_json);
        let mut signed = Vec::with_capacity(authenticator_data.len() + 32);
        signed.extend_from_slice(authenticator_data);
        signed.extend_from_slice(&client_data_hash);

        key.verify(&signed, &signature)
            .map_err(|_| denied("signature verification failed"))
    }
}

fn b64_field(req: &ProviderRequest, name: &str) -> AuthResult<Vec<u8>> {
    let raw = req.require(name)?;
    URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| AuthError::invalid_request(format!("{name} is not base64url")))
}

#[async_trait]
impl Provider for WebauthnProvider {
    fn kind(&self) -> &str {
        "webauthn"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "authorize") => {
                let challenge = random_digits(CHALLENGE_DIGITS);
                ctx.set(
                    CHALLENGE_SLOT,
                    CHALLENGE_TTL,
                    &PendingChallenge {
                        challenge: challenge.clone(),
                    },
                )
                .await?;
                Ok(ProviderResponse::Html(self.ui.ceremony(
                    &challenge,
                    &ctx.url_for("/verify"),
                    None,
                )))
            }

            ("POST", "verify") => {
                let pending: PendingChallenge = ctx
                    .get(CHALLENGE_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;

                let public_key = b64_field(&req, "public_key")?;
                let authenticator_data = b64_field(&req, "authenticator_data")?;
                let client_data_json = b64_field(&req, "client_data_json")?;
                let signature = b64_field(&req, "signature")?;

                match self.verify_assertion(
                    &pending.challenge,
                    &public_key,
                    &authenticator_data,
                    &client_data_json,
                    &signature,
                ) {
                    Ok(()) => {
                        ctx.unset(CHALLENGE_SLOT).await?;
                        Ok(ProviderResponse::Success(json!({
                            "publicKey": req.param("public_key"),
                            "credentialID": req.param("credential_id"),
                        })))
                    }
                    Err(_) => {
                        // A failed ceremony gets a fresh challenge.
                        let challenge = random_digits(CHALLENGE_DIGITS);
                        ctx.set(
                            CHALLENGE_SLOT,
                            CHALLENGE_TTL,
                            &PendingChallenge {
                                challenge: challenge.clone(),
                            },
                        )
                        .await?;
                        Ok(ProviderResponse::Html(self.ui.ceremony(
                            &challenge,
                            &ctx.url_for("/verify"),
                            Some("verification failed"),
                        )))
                    }
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
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;

    fn provider() -> WebauthnProvider {
        WebauthnProvider::new(WebauthnConfig {
            rp_id: "auth.test".to_string(),
            origin: "https://auth.test".to_string(),
            require_user_verification: true,
        })
    }

    struct TestAssertion {
        public_key: Vec<u8>,
        authenticator_data: Vec<u8>,
        client_data_json: Vec<u8>,
        signature: Vec<u8>,
    }

    /// Forges a structurally valid assertion signed by a fresh key.
    fn assertion(challenge: &str, origin: &str, rp_id: &str, flags: u8) -> TestAssertion {
        let signing = SigningKey::random(&mut OsRng);
        let public_key = signing
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        let mut authenticator_data = Vec::new();
        authenticator_data.extend_from_slice(&Sha256::digest(rp_id.as_bytes()));
        authenticator_data.push(flags);
        authenticator_data.extend_from_slice(&[0, 0, 0, 1]); // counter

        let client_data_json = serde_json::to_vec(&json!({
            "type": "webauthn.get",
            "challenge": URL_SAFE_NO_PAD.encode(challenge.as_bytes()),
            "origin": origin,
        }))
        .unwrap();

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_json));
        let signature: Signature = signing.sign(&signed);

        TestAssertion {
            public_key,
            authenticator_data,
            client_data_json,
            signature: signature.to_der().as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_valid_assertion_verifies() {
        let provider = provider();
        let a = assertion("12345", "https://auth.test", "auth.test", FLAG_UP | FLAG_UV);
        assert!(
            provider
                .verify_assertion(
                    "12345",
                    &a.public_key,
                    &a.authenticator_data,
                    &a.client_data_json,
                    &a.signature,
                )
                .is_ok()
        );
    }

    #[test]
    fn test_challenge_mismatch_rejected() {
        let provider = provider();
        let a = assertion("12345", "https://auth.test", "auth.test", FLAG_UP | FLAG_UV);
        let result = provider.verify_assertion(
            "99999",
            &a.public_key,
            &a.authenticator_data,
            &a.client_data_json,
            &a.signature,
        );
        assert!(matches!(result, Err(AuthError::AccessDenied { .. })));
    }

    #[test]
    fn test_wrong_origin_rejected() {
        let provider = provider();
        let a = assertion("12345", "https://evil.test", "auth.test", FLAG_UP | FLAG_UV);
        assert!(
            provider
                .verify_assertion(
                    "12345",
                    &a.public_key,
                    &a.authenticator_data,
                    &a.client_data_json,
                    &a.signature,
                )
                .is_err()
        );
    }

    #[test]
    fn test_wrong_rp_id_rejected() {
        let provider = provider();
        let a = assertion("12345", "https://auth.test", "evil.test", FLAG_UP | FLAG_UV);
        assert!(
            provider
                .verify_assertion(
                    "12345",
                    &a.public_key,
                    &a.authenticator_data,
                    &a.client_data_json,
                    &a.signature,
                )
                .is_err()
        );
    }

    #[test]
    fn test_missing_user_verification_rejected() {
        let provider = provider();
        let a = assertion("12345", "https://auth.test", "auth.test", FLAG_UP);
        assert!(
            provider
                .verify_assertion(
                    "12345",
                    &a.public_key,
                    &a.authenticator_data,
                    &a.client_data_json,
                    &a.signature,
                )
                .is_err()
        );
    }

    #[test]
    fn test_foreign_key_rejected() {
        let provider = provider();
        let a = assertion("12345", "https://auth.test", "auth.test", FLAG_UP | FLAG_UV);
        let other = assertion("12345", "https://auth.test", "auth.test", FLAG_UP | FLAG_UV);
        // Signature from one key, public key from another.
        assert!(
            provider
                .verify_assertion(
                    "12345",
                    &other.public_key,
                    &a.authenticator_data,
                    &a.client_data_json,
                    &a.signature,
                )
                .is_err()
        );
    }
}
