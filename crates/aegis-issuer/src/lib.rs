//! # aegis-issuer
//!
//! A self-hosted OAuth 2.1 / OpenID-Connect-flavored identity issuer.
//!
//! The issuer authenticates end users through pluggable identity providers,
//! mints short-lived access tokens and long-lived refresh tokens signed by a
//! rotating ES256 key, and validates those tokens on behalf of relying
//! parties.
//!
//! ## Modules
//!
//! - [`config`] - Issuer configuration, TTLs, and the hook traits
//! - [`keys`] - ES256 key generation, persistence, rotation, and JWKS
//! - [`token`] - Access/refresh token minting, rotation, and verification
//! - [`code`] - Single-use authorization codes
//! - [`provider`] - The provider plug-in protocol and built-in providers
//! - [`http`] - The axum router: `/authorize`, `/token`, `/userinfo`,
//!   `/.well-known/*`, and provider sub-routes
//!
//! ## Example
//!
//! ```ignore
//! use aegis_issuer::Issuer;
//! use aegis_storage::MemoryStorage;
//!
//! let issuer = Issuer::builder()
//!     .issuer("https://auth.example.com")
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .subjects(subjects)
//!     .provider("password", password_provider)
//!     .success(success_hook)
//!     .build()?;
//!
//! axum::serve(listener, issuer.router()).await?;
//! ```

pub mod code;
pub mod config;
pub mod http;
pub mod keys;
pub mod provider;
pub mod token;

pub use aegis_core::{AuthError, AuthResult, Subject, SubjectRegistry};
pub use config::{ClientGuard, DefaultClientGuard, IssuerConfig, SelectRenderer, SuccessHook, TtlConfig};
pub use http::{Issuer, IssuerBuilder, IssuerState};
pub use keys::{Jwk, Jwks, KeyStore};
pub use provider::{
    ClientCredentialsInput, Provider, ProviderContext, ProviderRequest, ProviderResponse,
    ProviderValue, SuccessContext,
};
pub use token::{TokenPair, TokenService};
