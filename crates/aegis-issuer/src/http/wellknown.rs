//! Discovery metadata and JWKS endpoints.
//!
//! Serves `/.well-known/oauth-authorization-server` (RFC 8414), its OIDC
//! mirror `/.well-known/openid-configuration`, and `/.well-known/jwks.json`.
//! Advertised endpoint URLs carry the configured `basePath` so relying
//! parties behind a reverse proxy resolve the right paths.

use axum::extract::State;
use axum::http::header;
use axum::Json;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::{IssuerState, oauth_error_json};

/// The issuer metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerMetadata {
    /// The issuer identifier.
    pub issuer: String,

    /// URL of the authorization endpoint.
    pub authorization_endpoint: String,

    /// URL of the token endpoint.
    pub token_endpoint: String,

    /// URL of the JWKS document.
    pub jwks_uri: String,

    /// URL of the userinfo endpoint.
    pub userinfo_endpoint: String,

    /// Supported response types.
    pub response_types_supported: Vec<String>,

    /// Supported grant types.
    pub grant_types_supported: Vec<String>,

    /// Supported PKCE challenge methods.
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported token-endpoint client authentication methods.
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl IssuerMetadata {
    fn for_state(state: &IssuerState) -> Self {
        let config = &state.0.config;
        Self {
            issuer: config.issuer.as_str().trim_end_matches('/').to_string(),
            authorization_endpoint: config.endpoint("/authorize"),
            token_endpoint: config.endpoint("/token"),
            jwks_uri: config.endpoint("/.well-known/jwks.json"),
            userinfo_endpoint: config.endpoint("/userinfo"),
            response_types_supported: vec!["code".to_string(), "token".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
                "client_credentials".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_post".to_string(),
                "client_secret_basic".to_string(),
                "none".to_string(),
            ],
        }
    }
}

/// Handler for both well-known metadata documents.
pub async fn metadata_handler(State(state): State<IssuerState>) -> Response {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(IssuerMetadata::for_state(&state)),
    )
        .into_response()
}

/// Handler for `GET /.well-known/jwks.json`.
pub async fn jwks_handler(State(state): State<IssuerState>) -> Response {
    match state.0.keys.jwks().await {
        Ok(jwks) => (
            [(header::CACHE_CONTROL, "public, max-age=3600")],
            Json(jwks),
        )
            .into_response(),
        Err(err) => oauth_error_json(&err),
    }
}
