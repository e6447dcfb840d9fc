//! SAML 2.0 provider (POST binding).
//!
//! Renders the IdP sign-on form carrying a RelayState nonce, accepts the
//! returned assertion POST, and extracts the `NameID` and attribute
//! statements. Cryptographic validation of the assertion (XML-DSig,
//! conditions, audience) is delegated to an injected
//! [`AssertionValidator`], which real deployments back with their SAML
//! toolchain of choice; the provider itself only enforces the RelayState
//! binding and the document structure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

use aegis_core::{AuthError, AuthResult};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_token};

/// Conversation slot for the RelayState nonce.
const RELAY_SLOT: &str = "relay";

/// RelayState lifetime in seconds.
const RELAY_TTL: i64 = 600;

/// Validates a decoded SAML response document.
#[async_trait]
pub trait AssertionValidator: Send + Sync {
    /// Verifies signatures and conditions on the raw XML document.
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` for invalid assertions.
    async fn validate(&self, xml: &str) -> AuthResult<()>;
}

/// Configuration for the SAML provider.
#[derive(Debug, Clone)]
pub struct SamlConfig {
    /// The IdP single-sign-on URL the login form posts to.
    pub idp_sso_url: String,

    /// This service provider's entity ID.
    pub sp_entity_id: String,
}

/// Renders the sign-on form.
pub trait SamlUi: Send + Sync {
    /// An auto-submitting form towards the IdP with the given RelayState.
    fn sign_on(&self, idp_sso_url: &str, sp_entity_id: &str, relay_state: &str) -> String {
        format!(
            "<!doctype html><html><body onload=\"document.forms[0].submit()\">\
             <form method=\"post\" action=\"{idp_sso_url}\">\
             <input type=\"hidden\" name=\"SAMLRequest\" value=\"\">\
             <input type=\"hidden\" name=\"RelayState\" value=\"{relay_state}\">\
             <input type=\"hidden\" name=\"Issuer\" value=\"{sp_entity_id}\">\
             <noscript><button type=\"submit\">Continue</button></noscript>\
             </form></body></html>"
        )
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSamlUi;

impl SamlUi for DefaultSamlUi {}

#[derive(Debug, Serialize, Deserialize)]
struct PendingRelay {
    relay_state: String,
}

/// The identity extracted from an assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct SamlIdentity {
    /// The subject `NameID`.
    pub name_id: String,

    /// Attribute statements, first value per attribute name.
    pub attributes: HashMap<String, String>,
}

/// Extracts `NameID` and attributes from a SAML response document.
///
/// # Errors
///
/// Returns `AccessDenied` for unparseable documents or a missing `NameID`.
pub fn extract_identity(xml: &str) -> AuthResult<SamlIdentity> {
    let malformed = |what: &str| AuthError::access_denied(format!("saml response: {what}"));

    let mut reader = Reader::from_str(xml);
    let mut name_id = None;
    let mut attributes = HashMap::new();

    let mut in_name_id = false;
    let mut in_attribute_value = false;
    let mut current_attribute: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"NameID" => in_name_id = true,
                b"Attribute" => {
                    current_attribute = element
                        .try_get_attribute("Name")
                        .map_err(|_| malformed("bad attribute"))?
                        .and_then(|attr| attr.unescape_value().ok())
                        .map(|value| value.into_owned());
                }
                b"AttributeValue" => in_attribute_value = true,
                _ => {}
            },
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"NameID" => in_name_id = false,
                b"Attribute" => current_attribute = None,
                b"AttributeValue" => in_attribute_value = false,
                _ => {}
            },
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|_| malformed("bad text"))?
                    .into_owned();
                if in_name_id {
                    name_id = Some(value);
                } else if in_attribute_value {
                    if let Some(name) = &current_attribute {
                        attributes.entry(name.clone()).or_insert(value);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(malformed("unparseable XML")),
            _ => {}
        }
    }

    Ok(SamlIdentity {
        name_id: name_id.ok_or_else(|| malformed("missing NameID"))?,
        attributes,
    })
}

/// SAML POST-binding authentication.
pub struct SamlProvider {
    config: SamlConfig,
    validator: Arc<dyn AssertionValidator>,
    ui: Arc<dyn SamlUi>,
}

impl SamlProvider {
    /// Creates a SAML provider over an assertion validator.
    #[must_use]
    pub fn new(config: SamlConfig, validator: Arc<dyn AssertionValidator>) -> Self {
        Self {
            config,
            validator,
            ui: Arc::new(DefaultSamlUi),
        }
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn SamlUi>) -> Self {
        self.ui = ui;
        self
    }
}

#[async_trait]
impl Provider for SamlProvider {
    fn kind(&self) -> &str {
        "saml"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "authorize") => {
                let relay_state = random_token();
                ctx.set(
                    RELAY_SLOT,
                    RELAY_TTL,
                    &PendingRelay {
                        relay_state: relay_state.clone(),
                    },
                )
                .await?;
                Ok(ProviderResponse::Html(self.ui.sign_on(
                    &self.config.idp_sso_url,
                    &self.config.sp_entity_id,
                    &relay_state,
                )))
            }

            ("POST", "callback") => {
                let pending: PendingRelay = ctx
                    .get(RELAY_SLOT)
                    .await?
                    .ok_or(AuthError::UnknownState)?;
                let relay_state = req.require("RelayState")?;
                if !bool::from(
                    relay_state
                        .as_bytes()
                        .ct_eq(pending.relay_state.as_bytes()),
                ) {
                    return Err(AuthError::UnknownState);
                }

                let encoded = req.require("SAMLResponse")?;
                let xml_bytes = STANDARD
                    .decode(encoded)
                    .map_err(|_| AuthError::access_denied("saml response: bad base64"))?;
                let xml = String::from_utf8(xml_bytes)
                    .map_err(|_| AuthError::access_denied("saml response: not utf-8"))?;

                self.validator.validate(&xml).await?;
                let identity = extract_identity(&xml)?;
                ctx.unset(RELAY_SLOT).await?;

                Ok(ProviderResponse::Success(json!({
                    "nameID": identity.name_id,
                    "attributes": identity.attributes,
                })))
            }

            _ => Err(AuthError::invalid_request(format!(
                "unknown provider route {}",
                req.path
            ))),
        }
    }
}
