//! The `/userinfo` endpoint.
//!
//! Verifies the bearer access token and returns the subject's properties.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use super::IssuerState;

/// Handler for `GET /userinfo`.
pub async fn userinfo_handler(State(state): State<IssuerState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized("missing bearer token");
    };

    match state.0.tokens.verify_access(token, None).await {
        Ok(verified) => Json(json!({
            "type": verified.subject.subject_type,
            "sub": verified.subject.id,
            "properties": verified.subject.properties,
        }))
        .into_response(),
        Err(err) => {
            debug!(error = %err, "userinfo verification failed");
            unauthorized("invalid access token")
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "error": "invalid_token",
            "error_description": message,
        })),
    )
        .into_response()
}
