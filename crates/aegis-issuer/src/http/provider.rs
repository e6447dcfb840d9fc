//! Provider sub-route dispatch and success continuation.
//!
//! Every request under `/{provider}/*` lands here: the handler resolves the
//! provider, rebuilds its conversation context from the state cookie, and
//! translates the provider's response. A `Success` payload re-enters the
//! issuer: the `success` hook maps it to a subject, and depending on the
//! original `response_type` the browser leaves with an authorization code
//! (query) or tokens (fragment).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::Json;
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde_json::Value;
use tracing::{debug, info, warn};

use aegis_core::{AuthError, AuthResult, parse_scopes};

use super::authorize::{AUTHORIZATION_SLOT, AuthorizationRequest, redirect_error};
use super::{IssuerState, clear_state_cookie, parse_form, read_request_id, with_fragment, with_query};
use crate::code::{AuthorizationCodeRecord, generate_code, store_code};
use crate::provider::{ProviderRequest, ProviderResponse, ProviderValue, SuccessContext};

/// Handler for `GET|POST /{provider}/{*rest}`.
pub async fn provider_handler(
    State(state): State<IssuerState>,
    Path((provider_name, rest)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(provider) = state.provider(&provider_name) else {
        return (StatusCode::NOT_FOUND, "unknown provider").into_response();
    };

    let Some(request_id) = read_request_id(&headers, &state.0.config.cookie_name) else {
        return (StatusCode::BAD_REQUEST, AuthError::UnknownState.to_string()).into_response();
    };

    let form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.starts_with("application/x-www-form-urlencoded"))
        .map(|_| parse_form(&body))
        .unwrap_or_default();

    let request = ProviderRequest {
        method,
        path: rest,
        query,
        form,
    };
    let ctx = state.provider_context(&request_id, &provider_name);

    match provider.handle(request, &ctx).await {
        Ok(ProviderResponse::Html(html)) => Html(html).into_response(),
        Ok(ProviderResponse::Redirect(url)) => Redirect::to(&url).into_response(),
        Ok(ProviderResponse::Json(value)) => Json(value).into_response(),
        Ok(ProviderResponse::Success(value)) => {
            finalize_success(&state, &request_id, &provider_name, value).await
        }
        Err(err) => provider_error(&state, &request_id, err).await,
    }
}

/// Completes a successful provider conversation.
async fn finalize_success(
    state: &IssuerState,
    request_id: &str,
    provider_name: &str,
    value: Value,
) -> Response {
    let auth_request = match load_authorization(state, request_id).await {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    match issue_response(state, &auth_request, provider_name, value).await {
        Ok(response) => {
            // The conversation is over; drop its state eagerly.
            let _ = state
                .0
                .storage
                .remove(&[
                    "oauth:provider".to_string(),
                    request_id.to_string(),
                    AUTHORIZATION_SLOT.to_string(),
                ])
                .await;
            let mut response = response;
            if let Ok(cookie) = clear_state_cookie(&state.0.config).parse() {
                response.headers_mut().insert(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(err) => {
            warn!(error = %err, provider = provider_name, "success continuation failed");
            redirect_error(
                &auth_request.redirect_uri,
                auth_request.state.as_deref(),
                &err,
            )
        }
    }
}

async fn load_authorization(
    state: &IssuerState,
    request_id: &str,
) -> AuthResult<AuthorizationRequest> {
    aegis_storage::get_json(
        state.0.storage.as_ref(),
        &[
            "oauth:provider".to_string(),
            request_id.to_string(),
            AUTHORIZATION_SLOT.to_string(),
        ],
    )
    .await
    .map_err(|e| AuthError::storage(e.to_string()))?
    .ok_or(AuthError::UnknownState)
}

async fn issue_response(
    state: &IssuerState,
    auth_request: &AuthorizationRequest,
    provider_name: &str,
    value: Value,
) -> AuthResult<Response> {
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

    info!(
        provider = provider_name,
        subject_type = %subject.subject_type,
        response_type = %auth_request.response_type,
        "provider conversation succeeded"
    );

    let scopes = auth_request
        .scope
        .as_deref()
        .map(parse_scopes)
        .filter(|scopes| !scopes.is_empty());

    match auth_request.response_type.as_str() {
        "code" => {
            let code = generate_code();
            store_code(
                state.0.storage.as_ref(),
                &code,
                &AuthorizationCodeRecord {
                    subject,
                    client_id: auth_request.client_id.clone(),
                    redirect_uri: auth_request.redirect_uri.clone(),
                    pkce: auth_request.pkce.clone(),
                    scopes,
                },
            )
            .await?;

            let mut params = vec![("code", code.as_str())];
            if let Some(state_param) = auth_request.state.as_deref() {
                params.push(("state", state_param));
            }
            Ok(Redirect::to(&with_query(&auth_request.redirect_uri, &params)).into_response())
        }

        "token" => {
            let pair = state
                .0
                .tokens
                .issue(&auth_request.client_id, &subject, scopes.as_deref())
                .await?;
            let expires_in = pair.expires_in.to_string();

            let mut params = vec![
                ("access_token", pair.access.as_str()),
                ("refresh_token", pair.refresh.as_str()),
                ("token_type", "Bearer"),
                ("expires_in", expires_in.as_str()),
            ];
            if let Some(state_param) = auth_request.state.as_deref() {
                params.push(("state", state_param));
            }
            Ok(Redirect::to(&with_fragment(&auth_request.redirect_uri, &params)).into_response())
        }

        other => Err(AuthError::unsupported_response_type(other)),
    }
}

/// Renders a provider-layer error.
///
/// When the conversation still knows its validated `redirect_uri` the error
/// goes back to the relying party as query parameters; otherwise a plain
/// HTTP error is all that is safe to emit.
async fn provider_error(state: &IssuerState, request_id: &str, err: AuthError) -> Response {
    debug!(error = %err, "provider request failed");
    match load_authorization(state, request_id).await {
        Ok(auth_request) => {
            redirect_error(&auth_request.redirect_uri, auth_request.state.as_deref(), &err)
        }
        Err(_) => {
            let status = if err.is_server_error() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            let message = if err.is_server_error() {
                "internal error".to_string()
            } else {
                err.to_string()
            };
            (status, message).into_response()
        }
    }
}
