//! End-to-end flow tests against a live issuer.
//!
//! Each test binds an ephemeral listener, serves the issuer router, and
//! drives it with a redirect-disabled HTTP client the way a relying party
//! and a browser would.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use aegis_core::pkce;
use aegis_core::{AuthResult, Subject, SubjectRegistry};
use aegis_issuer::provider::{Provider, ProviderContext, ProviderRequest, ProviderResponse};
use aegis_issuer::{Issuer, ProviderValue, SuccessContext, TtlConfig};
use aegis_storage::MemoryStorage;
use async_trait::async_trait;

#[derive(Debug, Serialize, Deserialize)]
struct UserProps {
    #[serde(rename = "userID")]
    user_id: String,
}

/// A provider that succeeds immediately on `GET /authorize`.
struct DummyProvider;

#[async_trait]
impl Provider for DummyProvider {
    fn kind(&self) -> &str {
        "dummy"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        _ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        assert_eq!(req.path, "authorize");
        Ok(ProviderResponse::Success(json!({"email": "a@b.com"})))
    }
}

async fn success_hook(ctx: SuccessContext, value: ProviderValue) -> AuthResult<Subject> {
    assert_eq!(value.provider, "dummy");
    assert_eq!(value.value["email"], "a@b.com");
    ctx.subject("user", json!({"userID": "123"}))
}

fn build_issuer(issuer_url: &str, base_path: &str, ttl: TtlConfig) -> Issuer {
    Issuer::builder()
        .issuer(issuer_url)
        .base_path(base_path)
        .ttl(ttl)
        .storage(Arc::new(MemoryStorage::new()))
        .subjects(SubjectRegistry::new().with_type::<UserProps>("user"))
        .provider("dummy", Arc::new(DummyProvider))
        .success(Arc::new(success_hook))
        .build()
        .expect("issuer builds")
}

/// Serves a router on an ephemeral port; the task dies with the test.
async fn serve(issuer: &Issuer) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let router = issuer.router();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("http://{addr}"), handle)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client builds")
}

fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("location")
        .expect("Location header")
        .to_str()
        .expect("utf-8 location")
        .to_string()
}

fn set_cookie(response: &reqwest::Response) -> String {
    let raw = response
        .headers()
        .get("set-cookie")
        .expect("Set-Cookie header")
        .to_str()
        .expect("utf-8 cookie");
    raw.split(';').next().expect("cookie pair").to_string()
}

/// Runs authorize → provider → callback, returning `(code, state)`.
async fn login(base: &str, prefix: &str, verifier_challenge: Option<(&str, &str)>) -> (String, String) {
    let http = client();
    let mut authorize = format!(
        "{base}{prefix}/authorize?client_id=client-1&redirect_uri=https://app.example.com/cb&response_type=code&state=st-1"
    );
    if let Some((_, challenge)) = verifier_challenge {
        authorize.push_str(&format!(
            "&code_challenge={challenge}&code_challenge_method=S256"
        ));
    }

    let response = http.get(&authorize).send().await.expect("authorize");
    assert_eq!(response.status(), 303, "authorize redirects to provider");
    let cookie = set_cookie(&response);
    let provider_path = location(&response);
    assert_eq!(provider_path, format!("{prefix}/dummy/authorize"));

    let response = http
        .get(format!("{base}{provider_path}"))
        .header("cookie", &cookie)
        .send()
        .await
        .expect("provider authorize");
    assert_eq!(response.status(), 303, "provider success redirects back");
    let callback = location(&response);
    assert!(
        callback.starts_with("https://app.example.com/cb?"),
        "redirect goes to the relying party unprefixed: {callback}"
    );

    let url = url::Url::parse(&callback).expect("callback URL");
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    (params["code"].clone(), params["state"].clone())
}

async fn exchange(
    base: &str,
    prefix: &str,
    form: &[(&str, &str)],
) -> (reqwest::StatusCode, Value) {
    let response = client()
        .post(format!("{base}{prefix}/token"))
        .form(form)
        .send()
        .await
        .expect("token request");
    let status = response.status();
    let body: Value = response.json().await.expect("json body");
    (status, body)
}

// ============================================================================
// Scenario: code flow with PKCE
// ============================================================================

#[tokio::test]
async fn test_code_flow_with_pkce() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (verifier, challenge) = pkce::generate();
    let (code, state) = login(&base, "", Some((verifier.as_str(), challenge.as_str()))).await;
    assert_eq!(state, "st-1");

    let (status, body) = exchange(
        &base,
        "",
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", "client-1"),
            ("redirect_uri", "https://app.example.com/cb"),
            ("code_verifier", verifier.as_str()),
        ],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["expires_in"], 30);
    assert_eq!(body["token_type"], "Bearer");
    let access = body["access_token"].as_str().expect("access token");
    assert!(body["refresh_token"].is_string());

    // The minted token resolves to the mapped subject.
    let response = client()
        .get(format!("{base}/userinfo"))
        .header("authorization", format!("Bearer {access}"))
        .send()
        .await
        .expect("userinfo");
    assert_eq!(response.status(), 200);
    let info: Value = response.json().await.expect("userinfo body");
    assert_eq!(info["type"], "user");
    assert_eq!(info["properties"]["userID"], "123");
}

#[tokio::test]
async fn test_pkce_wrong_verifier_rejected() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (_, challenge) = pkce::generate();
    let (wrong_verifier, _) = pkce::generate();
    let (code, _) = login(&base, "", Some(("unused", challenge.as_str()))).await;

    let (status, body) = exchange(
        &base,
        "",
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", "client-1"),
            ("redirect_uri", "https://app.example.com/cb"),
            ("code_verifier", wrong_verifier.as_str()),
        ],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_authorization_code_is_single_use() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (code, _) = login(&base, "", None).await;
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("client_id", "client-1"),
        ("redirect_uri", "https://app.example.com/cb"),
    ];

    let (status, _) = exchange(&base, "", &form).await;
    assert_eq!(status, 200);

    let (status, body) = exchange(&base, "", &form).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_client_and_redirect_must_match_code() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (code, _) = login(&base, "", None).await;
    let (status, body) = exchange(
        &base,
        "",
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", "other-client"),
            ("redirect_uri", "https://app.example.com/cb"),
        ],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_grant");
}

// ============================================================================
// Scenario: refresh grant
// ============================================================================

#[tokio::test]
async fn test_refresh_rotation_and_replay() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (code, _) = login(&base, "", None).await;
    let (_, body) = exchange(
        &base,
        "",
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", "client-1"),
            ("redirect_uri", "https://app.example.com/cb"),
        ],
    )
    .await;
    let refresh = body["refresh_token"].as_str().expect("refresh token");

    let (status, first) = exchange(
        &base,
        "",
        &[("grant_type", "refresh_token"), ("refresh_token", refresh)],
    )
    .await;
    assert_eq!(status, 200);
    assert_ne!(first["refresh_token"], refresh);

    // Replay within the reuse interval returns the identical pair.
    let (status, replay) = exchange(
        &base,
        "",
        &[("grant_type", "refresh_token"), ("refresh_token", refresh)],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(replay["access_token"], first["access_token"]);
    assert_eq!(replay["refresh_token"], first["refresh_token"]);
}

#[tokio::test]
async fn test_missing_refresh_token_is_invalid_request() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (status, body) = exchange(
        &base,
        "",
        &[("grant_type", "refresh_token"), ("refresh_token", "")],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_grant_type() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let (status, body) = exchange(&base, "", &[("grant_type", "implicit")]).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "unsupported_grant_type");
}

// ============================================================================
// Scenario: metadata and basePath
// ============================================================================

#[tokio::test]
async fn test_well_known_metadata_and_jwks() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let metadata: Value = client()
        .get(format!("{base}/.well-known/oauth-authorization-server"))
        .send()
        .await
        .expect("metadata")
        .json()
        .await
        .expect("metadata json");
    assert_eq!(metadata["issuer"], "https://auth.test");
    assert_eq!(
        metadata["authorization_endpoint"],
        "https://auth.test/authorize"
    );
    assert_eq!(metadata["code_challenge_methods_supported"], json!(["S256"]));

    let mirror: Value = client()
        .get(format!("{base}/.well-known/openid-configuration"))
        .send()
        .await
        .expect("mirror")
        .json()
        .await
        .expect("mirror json");
    assert_eq!(mirror["token_endpoint"], metadata["token_endpoint"]);

    let jwks: Value = client()
        .get(format!("{base}/.well-known/jwks.json"))
        .send()
        .await
        .expect("jwks")
        .json()
        .await
        .expect("jwks json");
    let keys = jwks["keys"].as_array().expect("keys array");
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "EC");
    assert_eq!(keys[0]["crv"], "P-256");
}

#[tokio::test]
async fn test_base_path_mounting() {
    let issuer = build_issuer(
        "https://auth.test",
        "/superbasepath",
        TtlConfig::default(),
    );
    let (base, _server) = serve(&issuer).await;

    // Metadata advertises the prefixed URLs.
    let metadata: Value = client()
        .get(format!(
            "{base}/superbasepath/.well-known/oauth-authorization-server"
        ))
        .send()
        .await
        .expect("metadata")
        .json()
        .await
        .expect("metadata json");
    assert_eq!(
        metadata["authorization_endpoint"],
        "https://auth.test/superbasepath/authorize"
    );

    // The whole flow routes under the prefix; the final redirect to the
    // relying party carries no prefix.
    let (code, _) = login(&base, "/superbasepath", None).await;
    let (status, body) = exchange(
        &base,
        "/superbasepath",
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", "client-1"),
            ("redirect_uri", "https://app.example.com/cb"),
        ],
    )
    .await;
    assert_eq!(status, 200);
    assert!(body["access_token"].is_string());
}

// ============================================================================
// Scenario: authorize validation
// ============================================================================

#[tokio::test]
async fn test_authorize_requires_client_and_redirect() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let response = client()
        .get(format!("{base}/authorize?response_type=code"))
        .send()
        .await
        .expect("authorize");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_authorize_rejects_plain_pkce_via_redirect() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let response = client()
        .get(format!(
            "{base}/authorize?client_id=c&redirect_uri=https://app.example.com/cb&response_type=code&code_challenge=x&code_challenge_method=plain"
        ))
        .send()
        .await
        .expect("authorize");
    // redirect_uri already validated, so the error redirects back.
    assert_eq!(response.status(), 303);
    let target = location(&response);
    assert!(target.starts_with("https://app.example.com/cb?"));
    assert!(target.contains("error=invalid_request"));
}

#[tokio::test]
async fn test_authorize_rejects_untrusted_redirect_without_redirecting() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    // Plain-HTTP non-localhost target fails the default guard.
    let response = client()
        .get(format!(
            "{base}/authorize?client_id=c&redirect_uri=http://evil.example.com/cb&response_type=code"
        ))
        .send()
        .await
        .expect("authorize");
    assert_eq!(response.status(), 400);
    assert!(response.headers().get("location").is_none());
}

#[tokio::test]
async fn test_provider_route_without_cookie_is_unknown_state() {
    let issuer = build_issuer("https://auth.test", "", TtlConfig::default());
    let (base, _server) = serve(&issuer).await;

    let response = client()
        .get(format!("{base}/dummy/authorize"))
        .send()
        .await
        .expect("provider route");
    assert_eq!(response.status(), 400);
}
