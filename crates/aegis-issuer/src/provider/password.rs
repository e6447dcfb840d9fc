//! Password provider.
//!
//! Three conversations share this provider: login, register, and change.
//! Registration and change both gate on an emailed verification code before
//! any hash is written; the change flow refuses to accept a new password
//! until the code step has completed in the same conversation.
//!
//! Hashes live under `["email", <email>, "password"]` in PHC string format,
//! produced by a pluggable [`PasswordHasher`] (scrypt by default, PBKDF2 as
//! the alternative). Verification goes through the PHC library's
//! constant-time comparison.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::debug;

use aegis_core::{AuthError, AuthResult};

use super::code::CodeSender;
use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, random_digits};

/// Conversation slot for pending registrations.
const REGISTER_SLOT: &str = "register";

/// Conversation slot for pending password changes.
const CHANGE_SLOT: &str = "change";

/// Pending-step lifetime in seconds.
const PENDING_TTL: i64 = 600;

// ============================================================================
// Hashers
// ============================================================================

/// Hashes and verifies passwords.
///
/// `verify` must be constant-time in the hash comparison; both built-in
/// implementations inherit that from the PHC `password-hash` machinery.
pub trait PasswordHasher: Send + Sync {
    /// Hashes a password into a PHC string.
    ///
    /// # Errors
    ///
    /// Returns a server error if hashing fails.
    fn hash(&self, password: &str) -> AuthResult<String>;

    /// Verifies a password against a stored PHC string.
    ///
    /// # Errors
    ///
    /// Returns a server error only for malformed stored hashes; a wrong
    /// password is `Ok(false)`.
    fn verify(&self, password: &str, hash: &str) -> AuthResult<bool>;
}

/// The default hasher: scrypt with the crate's recommended parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScryptHasher;

impl PasswordHasher for ScryptHasher {
    fn hash(&self, password: &str) -> AuthResult<String> {
        use password_hash::{PasswordHasher as _, SaltString};
        let salt = SaltString::generate(&mut rand::thread_rng());
        scrypt::Scrypt
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::server_error(format!("scrypt: {e}")))
    }

    fn verify(&self, password: &str, hash: &str) -> AuthResult<bool> {
        use password_hash::{PasswordHash, PasswordVerifier as _};
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::server_error(format!("stored hash: {e}")))?;
        Ok(scrypt::Scrypt
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Alternative hasher: PBKDF2-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbkdf2Hasher;

impl PasswordHasher for Pbkdf2Hasher {
    fn hash(&self, password: &str) -> AuthResult<String> {
        use password_hash::{PasswordHasher as _, SaltString};
        let salt = SaltString::generate(&mut rand::thread_rng());
        pbkdf2::Pbkdf2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::server_error(format!("pbkdf2: {e}")))
    }

    fn verify(&self, password: &str, hash: &str) -> AuthResult<bool> {
        use password_hash::{PasswordHash, PasswordVerifier as _};
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::server_error(format!("stored hash: {e}")))?;
        Ok(pbkdf2::Pbkdf2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

// ============================================================================
// UI
// ============================================================================

/// Renders the password provider's pages.
pub trait PasswordUi: Send + Sync {
    /// The login form.
    fn login(&self, action: &str, register_action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{action}\">\
             <input name=\"email\" type=\"email\" required>\
             <input name=\"password\" type=\"password\" required>\
             <button type=\"submit\">Sign in</button></form>\
             <a href=\"{register_action}\">Register</a></body></html>"
        )
    }

    /// The registration form.
    fn register(&self, action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{action}\">\
             <input name=\"email\" type=\"email\" required>\
             <input name=\"password\" type=\"password\" required>\
             <button type=\"submit\">Register</button></form></body></html>"
        )
    }

    /// The code-entry step used by register and change.
    fn code(&self, action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{action}\">\
             <input name=\"code\" inputmode=\"numeric\" required>\
             <button type=\"submit\">Verify</button></form></body></html>"
        )
    }

    /// The change form (email entry).
    fn change(&self, action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{action}\">\
             <input name=\"email\" type=\"email\" required>\
             <button type=\"submit\">Send code</button></form></body></html>"
        )
    }

    /// The new-password step after a verified change code.
    fn update(&self, action: &str, error: Option<&str>) -> String {
        let error = error.map(|e| format!("<p>{e}</p>")).unwrap_or_default();
        format!(
            "<!doctype html><html><body>{error}<form method=\"post\" action=\"{action}\">\
             <input name=\"password\" type=\"password\" required>\
             <button type=\"submit\">Set password</button></form></body></html>"
        )
    }
}

/// The built-in minimal UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPasswordUi;

impl PasswordUi for DefaultPasswordUi {}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PendingRegister {
    email: String,
    hash: String,
    code: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingChange {
    email: String,
    code: String,
    verified: bool,
}

/// Password authentication with registration and change flows.
pub struct PasswordProvider {
    hasher: Arc<dyn PasswordHasher>,
    sender: Arc<dyn CodeSender>,
    ui: Arc<dyn PasswordUi>,
    code_length: usize,
}

impl PasswordProvider {
    /// Creates a password provider with the scrypt hasher and default UI.
    #[must_use]
    pub fn new(sender: Arc<dyn CodeSender>) -> Self {
        Self {
            hasher: Arc::new(ScryptHasher),
            sender,
            ui: Arc::new(DefaultPasswordUi),
            code_length: 6,
        }
    }

    /// Overrides the password hasher.
    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Overrides the UI renderer.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn PasswordUi>) -> Self {
        self.ui = ui;
        self
    }

    fn hash_key(email: &str) -> Vec<String> {
        vec![
            "email".to_string(),
            email.to_lowercase(),
            "password".to_string(),
        ]
    }

    async fn stored_hash(&self, ctx: &ProviderContext, email: &str) -> AuthResult<Option<String>> {
        let value = ctx
            .storage()
            .get(&Self::hash_key(email))
            .await
            .map_err(|e| AuthError::storage(e.to_string()))?;
        Ok(value.and_then(|v| v.as_str().map(ToString::to_string)))
    }

    async fn write_hash(&self, ctx: &ProviderContext, email: &str, hash: &str) -> AuthResult<()> {
        ctx.storage()
            .set(&Self::hash_key(email), Value::String(hash.to_string()), None)
            .await
            .map_err(|e| AuthError::storage(e.to_string()))
    }

    fn success(email: &str) -> ProviderResponse {
        ProviderResponse::Success(json!({ "email": email.to_lowercase() }))
    }

    async fn send_code(
        &self,
        email: &str,
        code: &str,
    ) -> AuthResult<()> {
        let mut claims = HashMap::new();
        claims.insert("email".to_string(), email.to_string());
        self.sender.send(&claims, code).await
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    async fn login(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let retry = |ui: &dyn PasswordUi, ctx: &ProviderContext| {
            ProviderResponse::Html(ui.login(
                &ctx.url_for("/login"),
                &ctx.url_for("/register"),
                Some("invalid email or password"),
            ))
        };

        let (Some(email), Some(password)) = (req.param("email"), req.param("password")) else {
            return Ok(retry(self.ui.as_ref(), ctx));
        };
        let Some(hash) = self.stored_hash(ctx, email).await? else {
            // Burn a verification anyway so unknown emails take as long as
            // wrong passwords.
            let _ = self.hasher.verify(password, &self.hasher.hash("timing-pad")?);
            return Ok(retry(self.ui.as_ref(), ctx));
        };
        if self.hasher.verify(password, &hash)? {
            debug!(provider = ctx.provider_name(), "password login succeeded");
            Ok(Self::success(email))
        } else {
            Ok(retry(self.ui.as_ref(), ctx))
        }
    }

    async fn register_submit(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let (Some(email), Some(password)) = (req.param("email"), req.param("password")) else {
            return Ok(ProviderResponse::Html(
                self.ui
                    .register(&ctx.url_for("/register"), Some("email and password required")),
            ));
        };
        if self.stored_hash(ctx, email).await?.is_some() {
            return Ok(ProviderResponse::Html(
                self.ui
                    .register(&ctx.url_for("/register"), Some("account already exists")),
            ));
        }

        let code = random_digits(self.code_length);
        ctx.set(
            REGISTER_SLOT,
            PENDING_TTL,
            &PendingRegister {
                email: email.to_lowercase(),
                hash: self.hasher.hash(password)?,
                code: code.clone(),
            },
        )
        .await?;
        self.send_code(email, &code).await?;
        Ok(ProviderResponse::Html(
            self.ui.code(&ctx.url_for("/register/verify"), None),
        ))
    }

    async fn register_verify(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let pending: PendingRegister = ctx
            .get(REGISTER_SLOT)
            .await?
            .ok_or(AuthError::UnknownState)?;
        let submitted = req.param("code").unwrap_or_default();
        if !bool::from(submitted.as_bytes().ct_eq(pending.code.as_bytes())) {
            return Ok(ProviderResponse::Html(
                self.ui
                    .code(&ctx.url_for("/register/verify"), Some("invalid code")),
            ));
        }
        self.write_hash(ctx, &pending.email, &pending.hash).await?;
        ctx.unset(REGISTER_SLOT).await?;
        Ok(Self::success(&pending.email))
    }

    async fn change_submit(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let Some(email) = req.param("email") else {
            return Ok(ProviderResponse::Html(
                self.ui.change(&ctx.url_for("/change"), Some("email required")),
            ));
        };
        if self.stored_hash(ctx, email).await?.is_none() {
            return Ok(ProviderResponse::Html(
                self.ui.change(&ctx.url_for("/change"), Some("unknown account")),
            ));
        }
        let code = random_digits(self.code_length);
        ctx.set(
            CHANGE_SLOT,
            PENDING_TTL,
            &PendingChange {
                email: email.to_lowercase(),
                code: code.clone(),
                verified: false,
            },
        )
        .await?;
        self.send_code(email, &code).await?;
        Ok(ProviderResponse::Html(
            self.ui.code(&ctx.url_for("/change/verify"), None),
        ))
    }

    async fn change_verify(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let mut pending: PendingChange = ctx
            .get(CHANGE_SLOT)
            .await?
            .ok_or(AuthError::UnknownState)?;
        let submitted = req.param("code").unwrap_or_default();
        if !bool::from(submitted.as_bytes().ct_eq(pending.code.as_bytes())) {
            return Ok(ProviderResponse::Html(
                self.ui
                    .code(&ctx.url_for("/change/verify"), Some("invalid code")),
            ));
        }
        pending.verified = true;
        ctx.set(CHANGE_SLOT, PENDING_TTL, &pending).await?;
        Ok(ProviderResponse::Html(
            self.ui.update(&ctx.url_for("/change/password"), None),
        ))
    }

    async fn change_password(
        &self,
        req: &ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        let pending: PendingChange = ctx
            .get(CHANGE_SLOT)
            .await?
            .ok_or(AuthError::UnknownState)?;
        // The update step is only reachable through a verified code; a
        // conversation that skipped the code step stops here.
        if !pending.verified {
            return Err(AuthError::UnknownState);
        }
        let Some(password) = req.param("password") else {
            return Ok(ProviderResponse::Html(
                self.ui
                    .update(&ctx.url_for("/change/password"), Some("password required")),
            ));
        };
        let hash = self.hasher.hash(password)?;
        self.write_hash(ctx, &pending.email, &hash).await?;
        ctx.unset(CHANGE_SLOT).await?;
        Ok(Self::success(&pending.email))
    }
}

#[async_trait]
impl Provider for PasswordProvider {
    fn kind(&self) -> &str {
        "password"
    }

    async fn handle(
        &self,
        req: ProviderRequest,
        ctx: &ProviderContext,
    ) -> AuthResult<ProviderResponse> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "authorize") => Ok(ProviderResponse::Html(self.ui.login(
                &ctx.url_for("/login"),
                &ctx.url_for("/register"),
                None,
            ))),
            ("POST", "login") => self.login(&req, ctx).await,
            ("GET", "register") => Ok(ProviderResponse::Html(
                self.ui.register(&ctx.url_for("/register"), None),
            )),
            ("POST", "register") => self.register_submit(&req, ctx).await,
            ("POST", "register/verify") => self.register_verify(&req, ctx).await,
            ("GET", "change") => Ok(ProviderResponse::Html(
                self.ui.change(&ctx.url_for("/change"), None),
            )),
            ("POST", "change") => self.change_submit(&req, ctx).await,
            ("POST", "change/verify") => self.change_verify(&req, ctx).await,
            ("POST", "change/password") => self.change_password(&req, ctx).await,
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
        codes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeSender for RecordingSender {
        async fn send(&self, _claims: &HashMap<String, String>, code: &str) -> AuthResult<()> {
            self.codes.lock().await.push(code.to_string());
            Ok(())
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new(
            "req-1",
            "password",
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

    async fn register(
        provider: &PasswordProvider,
        sender: &RecordingSender,
        ctx: &ProviderContext,
        email: &str,
        password: &str,
    ) {
        provider
            .handle(
                post("register", &[("email", email), ("password", password)]),
                ctx,
            )
            .await
            .unwrap();
        let code = sender.codes.lock().await.last().unwrap().clone();
        let response = provider
            .handle(post("register/verify", &[("code", code.as_str())]), ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Success(_)));
    }

    #[test]
    fn test_scrypt_hash_verify() {
        let hasher = ScryptHasher;
        let hash = hasher.hash("hunter2").unwrap();
        assert!(hash.starts_with("$scrypt$"));
        assert!(hasher.verify("hunter2", &hash).unwrap());
        assert!(!hasher.verify("hunter3", &hash).unwrap());
    }

    #[test]
    fn test_pbkdf2_hash_verify() {
        let hasher = Pbkdf2Hasher;
        let hash = hasher.hash("hunter2").unwrap();
        assert!(hash.starts_with("$pbkdf2"));
        assert!(hasher.verify("hunter2", &hash).unwrap());
        assert!(!hasher.verify("wrong", &hash).unwrap());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let sender = Arc::new(RecordingSender::default());
        let provider = PasswordProvider::new(sender.clone());
        let ctx = ctx();

        register(&provider, &sender, &ctx, "A@B.com", "hunter2").await;

        // Email is normalized, password verifies.
        let response = provider
            .handle(
                post("login", &[("email", "a@b.com"), ("password", "hunter2")]),
                &ctx,
            )
            .await
            .unwrap();
        let ProviderResponse::Success(value) = response else {
            panic!("expected success");
        };
        assert_eq!(value["email"], "a@b.com");
    }

    #[tokio::test]
    async fn test_login_wrong_password_rerenders() {
        let sender = Arc::new(RecordingSender::default());
        let provider = PasswordProvider::new(sender.clone());
        let ctx = ctx();

        register(&provider, &sender, &ctx, "a@b.com", "hunter2").await;

        let response = provider
            .handle(
                post("login", &[("email", "a@b.com"), ("password", "nope")]),
                &ctx,
            )
            .await
            .unwrap();
        let ProviderResponse::Html(html) = response else {
            panic!("expected retry form");
        };
        assert!(html.contains("invalid email or password"));
    }

    #[tokio::test]
    async fn test_register_wrong_code_never_writes_hash() {
        let sender = Arc::new(RecordingSender::default());
        let provider = PasswordProvider::new(sender);
        let ctx = ctx();

        provider
            .handle(
                post("register", &[("email", "a@b.com"), ("password", "pw")]),
                &ctx,
            )
            .await
            .unwrap();
        let response = provider
            .handle(post("register/verify", &[("code", "000000")]), &ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Html(_)));

        // No hash landed, so login fails.
        let response = provider
            .handle(post("login", &[("email", "a@b.com"), ("password", "pw")]), &ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Html(_)));
    }

    #[tokio::test]
    async fn test_change_requires_verified_code() {
        let sender = Arc::new(RecordingSender::default());
        let provider = PasswordProvider::new(sender.clone());
        let ctx = ctx();

        register(&provider, &sender, &ctx, "a@b.com", "old-pw").await;

        provider
            .handle(post("change", &[("email", "a@b.com")]), &ctx)
            .await
            .unwrap();

        // Skipping the code step and posting a password directly is refused.
        let result = provider
            .handle(post("change/password", &[("password", "new-pw")]), &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::UnknownState)));

        // With the code verified, the change lands.
        let code = sender.codes.lock().await.last().unwrap().clone();
        provider
            .handle(post("change/verify", &[("code", code.as_str())]), &ctx)
            .await
            .unwrap();
        let response = provider
            .handle(post("change/password", &[("password", "new-pw")]), &ctx)
            .await
            .unwrap();
        assert!(matches!(response, ProviderResponse::Success(_)));

        // Old password is dead, new one works.
        let old = provider
            .handle(
                post("login", &[("email", "a@b.com"), ("password", "old-pw")]),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(old, ProviderResponse::Html(_)));
        let new = provider
            .handle(
                post("login", &[("email", "a@b.com"), ("password", "new-pw")]),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(new, ProviderResponse::Success(_)));
    }
}
