//! The `/token` endpoint.
//!
//! Accepts `application/x-www-form-urlencoded` grant requests:
//!
//! - `authorization_code` - single-use code exchange with client, redirect,
//!   and PKCE verification
//! - `refresh_token` - rotation through the token service
//! - `client_credentials` - dispatched to the named provider's `client`
//!   callback, minting tokens for the calling service itself
//!
//! Errors follow RFC 6749 §5.2: JSON `{error, error_description}` with 400
//! (or 401 for `invalid_client`).

use std::collections::HashMap;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use axum::response::{IntoResponse, Response};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::json;
use tracing::{debug, info, warn};

use aegis_core::{AuthError, AuthResult, pkce, validate_scopes};

use super::{IssuerState, oauth_error_json, parse_form};
use crate::code::take_code;
use crate::provider::{ClientCredentialsInput, ProviderValue, SuccessContext};
use crate::token::TokenPair;

/// Token request parameters across all grant types.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    /// One of `authorization_code`, `refresh_token`, `client_credentials`.
    pub grant_type: String,

    /// Authorization code (`authorization_code` grant).
    pub code: Option<String>,

    /// Redirect URI; must match the authorization request.
    pub redirect_uri: Option<String>,

    /// PKCE code verifier.
    pub code_verifier: Option<String>,

    /// Client ID.
    pub client_id: Option<String>,

    /// Client secret (`client_credentials` grant).
    pub client_secret: Option<String>,

    /// Refresh token (`refresh_token` grant).
    pub refresh_token: Option<String>,

    /// Requested scope; narrowed against the authorized set.
    pub scope: Option<String>,

    /// Provider to dispatch `client_credentials` to.
    pub provider: Option<String>,

    /// Remaining provider-defined parameters.
    pub extra: HashMap<String, String>,
}

impl TokenRequest {
    /// Builds a request from the decoded form body; unrecognized fields
    /// land in `extra` for provider dispatch.
    #[must_use]
    pub fn from_params(mut params: HashMap<String, String>) -> Self {
        let mut take = |name: &str| params.remove(name).filter(|value| !value.is_empty());
        Self {
            grant_type: take("grant_type").unwrap_or_default(),
            code: take("code"),
            redirect_uri: take("redirect_uri"),
            code_verifier: take("code_verifier"),
            client_id: take("client_id"),
            client_secret: take("client_secret"),
            refresh_token: take("refresh_token"),
            scope: take("scope"),
            provider: take("provider"),
            extra: params,
        }
    }
}

/// Handler for `POST /token`.
pub async fn token_handler(
    State(state): State<IssuerState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request = TokenRequest::from_params(parse_form(&body));
    debug!(grant_type = %request.grant_type, "processing token request");

    let result = match request.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, &request).await,
        "refresh_token" => refresh_token_grant(&state, &request).await,
        "client_credentials" => client_credentials_grant(&state, &headers, &request).await,
        other => {
            warn!(grant_type = other, "unsupported grant type");
            Err(AuthError::unsupported_grant_type(other))
        }
    };

    match result {
        Ok((pair, scopes)) => {
            info!(grant_type = %request.grant_type, "tokens issued");
            token_response(&pair, scopes.as_deref())
        }
        Err(err) => {
            debug!(grant_type = %request.grant_type, error = %err, "token request failed");
            oauth_error_json(&err)
        }
    }
}

fn token_response(pair: &TokenPair, scopes: Option<&[String]>) -> Response {
    let mut body = json!({
        "access_token": pair.access,
        "refresh_token": pair.refresh,
        "token_type": "Bearer",
        "expires_in": pair.expires_in,
    });
    if let Some(scopes) = scopes {
        body["scope"] = json!(scopes.join(" "));
    }
    Json(body).into_response()
}

async fn authorization_code_grant(
    state: &IssuerState,
    request: &TokenRequest,
) -> AuthResult<(TokenPair, Option<Vec<String>>)> {
    let code = request
        .code
        .as_deref()
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AuthError::missing_parameter("code"))?;
    let client_id = request
        .client_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AuthError::missing_parameter("client_id"))?;

    // Fetch-and-delete makes the code single-use.
    let record = take_code(state.0.storage.as_ref(), code).await?;

    if record.client_id != client_id {
        return Err(AuthError::invalid_grant("client_id mismatch"));
    }
    match request.redirect_uri.as_deref() {
        Some(redirect_uri) if redirect_uri == record.redirect_uri => {}
        _ => return Err(AuthError::invalid_grant("redirect_uri mismatch")),
    }

    if let Some(binding) = &record.pkce {
        let verifier = request
            .code_verifier
            .as_deref()
            .filter(|verifier| !verifier.is_empty())
            .ok_or_else(|| AuthError::missing_parameter("code_verifier"))?;
        pkce::verify(&binding.challenge, verifier, binding.method)
            .map_err(|_| AuthError::invalid_grant("PKCE verification failed"))?;
    }

    let scopes = validate_scopes(request.scope.as_deref(), record.scopes.as_deref());
    let pair = state
        .0
        .tokens
        .issue(&record.client_id, &record.subject, scopes.as_deref())
        .await?;
    Ok((pair, scopes))
}

async fn refresh_token_grant(
    state: &IssuerState,
    request: &TokenRequest,
) -> AuthResult<(TokenPair, Option<Vec<String>>)> {
    let refresh_token = request
        .refresh_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::missing_parameter("refresh_token"))?;
    let pair = state.0.tokens.consume_refresh(refresh_token).await?;
    Ok((pair, None))
}

async fn client_credentials_grant(
    state: &IssuerState,
    headers: &HeaderMap,
    request: &TokenRequest,
) -> AuthResult<(TokenPair, Option<Vec<String>>)> {
    let provider_name = request
        .provider
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AuthError::missing_parameter("provider"))?;
    let provider = state
        .provider(provider_name)
        .ok_or_else(|| AuthError::invalid_request(format!("unknown provider {provider_name}")))?;

    let (client_id, client_secret) = client_auth(headers, request)?;

    // Client-credentials calls have no browser conversation; the context is
    // ephemeral and exists only for storage access.
    let ctx = state.provider_context(&uuid::Uuid::new_v4().to_string(), provider_name);
    let value = provider
        .client(
            ClientCredentialsInput {
                client_id: client_id.clone(),
                client_secret,
                params: request.extra.clone(),
            },
            &ctx,
        )
        .await?;

    let subject = state
        .0
        .success
        .on_success(
            SuccessContext::new(state.0.subjects.clone()),
            ProviderValue {
                provider: provider_name.to_string(),
                value,
            },
        )
        .await?;

    // The audience is the calling service itself, not a human's client.
    let pair = state.0.tokens.issue(&client_id, &subject, None).await?;
    Ok((pair, None))
}

/// Extracts client credentials from the Basic header or the form body.
fn client_auth(
    headers: &HeaderMap,
    request: &TokenRequest,
) -> AuthResult<(String, Option<String>)> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let raw = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Basic "))
            .ok_or_else(|| AuthError::invalid_client("malformed Authorization header"))?;
        let decoded = STANDARD
            .decode(raw)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| AuthError::invalid_client("malformed Basic credentials"))?;
        let (client_id, client_secret) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::invalid_client("malformed Basic credentials"))?;
        return Ok((client_id.to_string(), Some(client_secret.to_string())));
    }

    let client_id = request
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AuthError::missing_parameter("client_id"))?;
    Ok((client_id, request.client_secret.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_auth_from_basic_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("svc:hunter2"))
                .parse()
                .unwrap(),
        );
        let request = TokenRequest::from_params(parse_form("grant_type=client_credentials"));
        let (id, secret) = client_auth(&headers, &request).unwrap();
        assert_eq!(id, "svc");
        assert_eq!(secret.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_client_auth_from_form() {
        let request = TokenRequest::from_params(parse_form(
            "grant_type=client_credentials&client_id=svc&client_secret=pw",
        ));
        let (id, secret) = client_auth(&HeaderMap::new(), &request).unwrap();
        assert_eq!(id, "svc");
        assert_eq!(secret.as_deref(), Some("pw"));
    }

    #[test]
    fn test_token_request_extra_params() {
        let request = TokenRequest::from_params(parse_form(
            "grant_type=client_credentials&provider=machine&tenant=acme",
        ));
        assert_eq!(request.provider.as_deref(), Some("machine"));
        assert_eq!(request.extra["tenant"], "acme");
    }
}
