//! The `/authorize` endpoint.
//!
//! Validates the relying party's request, persists it under a fresh
//! conversation ID bound to the browser by the state cookie, and hands the
//! user to a provider: directly when the request names one (or only one is
//! configured), otherwise via the provider-selection page.
//!
//! Error handling follows the redirect-safety rule: until `redirect_uri`
//! has been validated against the `allow` guard the endpoint answers with a
//! plain HTTP error, never a redirect to an untrusted URL. Afterwards,
//! errors redirect back with `error`/`error_description` query parameters.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aegis_core::pkce::PkceMethod;
use aegis_core::{AuthError, AuthResult};

use super::{IssuerState, state_cookie, with_query};
use crate::code::PkceBinding;

/// Conversation slot holding the validated authorization request.
pub(crate) const AUTHORIZATION_SLOT: &str = "authorization";

/// The validated `/authorize` inputs, persisted for the whole conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<PkceBinding>,
}

/// Handler for `GET /authorize`.
pub async fn authorize_handler(
    State(state): State<IssuerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // --- pre-validation: plain HTTP errors only -----------------------------
    let Some(client_id) = params.get("client_id").filter(|v| !v.is_empty()) else {
        return bad_request("client_id is required");
    };
    let Some(redirect_uri) = params.get("redirect_uri").filter(|v| !v.is_empty()) else {
        return bad_request("redirect_uri is required");
    };
    if url::Url::parse(redirect_uri).is_err() {
        return bad_request("redirect_uri is not a valid URL");
    }
    if !state.0.allow.allow(client_id, redirect_uri).await {
        warn!(%client_id, %redirect_uri, "authorization guard rejected client");
        return bad_request("client is not authorized for this redirect_uri");
    }

    // --- post-validation: errors redirect back ------------------------------
    match start_conversation(&state, &params, client_id, redirect_uri).await {
        Ok(response) => response,
        Err(err) => {
            debug!(error = %err, "authorize request failed");
            redirect_error(redirect_uri, params.get("state").map(String::as_str), &err)
        }
    }
}

async fn start_conversation(
    state: &IssuerState,
    params: &HashMap<String, String>,
    client_id: &str,
    redirect_uri: &str,
) -> AuthResult<Response> {
    let response_type = params
        .get("response_type")
        .ok_or_else(|| AuthError::missing_parameter("response_type"))?;
    if response_type != "code" && response_type != "token" {
        return Err(AuthError::unsupported_response_type(response_type));
    }

    let pkce = match params.get("code_challenge").filter(|v| !v.is_empty()) {
        Some(challenge) => {
            let method = params
                .get("code_challenge_method")
                .map(String::as_str)
                .unwrap_or("S256");
            let method = PkceMethod::parse(method)
                .map_err(|e| AuthError::invalid_request(e.to_string()))?;
            Some(PkceBinding {
                challenge: challenge.clone(),
                method,
            })
        }
        None => None,
    };

    let request = AuthorizationRequest {
        client_id: client_id.to_string(),
        redirect_uri: redirect_uri.to_string(),
        response_type: response_type.clone(),
        state: params.get("state").cloned(),
        scope: params.get("scope").cloned(),
        pkce,
    };

    // Bind the conversation to the browser.
    let request_id = uuid::Uuid::new_v4().to_string();
    let config = &state.0.config;
    aegis_storage::set_json(
        state.0.storage.as_ref(),
        &[
            "oauth:provider".to_string(),
            request_id.clone(),
            AUTHORIZATION_SLOT.to_string(),
        ],
        &request,
        Some(config.conversation_duration()),
    )
    .await
    .map_err(|e| AuthError::storage(e.to_string()))?;

    let cookie = state_cookie(config, &request_id);

    // Choose the provider: explicit parameter, sole registration, or the
    // selection page.
    let chosen = params
        .get("provider")
        .cloned()
        .or_else(|| match state.0.providers.as_slice() {
            [(name, _)] => Some(name.clone()),
            _ => None,
        });

    let response = match chosen {
        Some(provider) => {
            if state.provider(&provider).is_none() {
                return Err(AuthError::invalid_request(format!(
                    "unknown provider {provider}"
                )));
            }
            debug!(provider = %provider, "forwarding to provider authorize");
            Redirect::to(&config.relative(&format!("/{provider}/authorize"))).into_response()
        }
        None => {
            let listing: Vec<(String, String)> = state
                .0
                .providers
                .iter()
                .map(|(name, provider)| (name.clone(), provider.kind().to_string()))
                .collect();
            let base = if config.base_path.is_empty() {
                String::new()
            } else {
                config.base_path.clone()
            };
            Html(state.0.select.render(&listing, &base)).into_response()
        }
    };

    let mut response = response;
    let cookie = cookie
        .parse()
        .map_err(|_| AuthError::server_error("cookie header encoding"))?;
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

/// Redirects back to a validated `redirect_uri` with OAuth error params.
pub(crate) fn redirect_error(
    redirect_uri: &str,
    state: Option<&str>,
    err: &AuthError,
) -> Response {
    let description = if err.is_server_error() {
        "internal error".to_string()
    } else {
        err.to_string()
    };
    let mut params = vec![
        ("error", err.oauth_error_code()),
        ("error_description", description.as_str()),
    ];
    if let Some(state) = state {
        params.push(("state", state));
    }
    Redirect::to(&with_query(redirect_uri, &params)).into_response()
}
