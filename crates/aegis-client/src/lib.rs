//! # aegis-client
//!
//! Relying-party client for an aegis identity issuer.
//!
//! The client consumes the issuer's published metadata and JWKS (cached per
//! issuer URL), builds authorization URLs with optional PKCE, exchanges
//! authorization codes, verifies access tokens locally, and transparently
//! refreshes them when a refresh token is at hand.
//!
//! ## Example
//!
//! ```ignore
//! let client = Client::builder("my-app", "https://auth.example.com")
//!     .subjects(subjects)
//!     .build();
//!
//! let authorize = client.authorize("https://app.example.com/cb", "code",
//!     AuthorizeOptions { pkce: true, ..Default::default() })?;
//! // redirect the user to authorize.url ...
//!
//! let tokens = client
//!     .exchange(&code, "https://app.example.com/cb", authorize.challenge.verifier.as_deref())
//!     .await?;
//! let verified = client.verify(&tokens.access, VerifyOptions::default()).await?;
//! ```
//!
//! Errors are structured values ([`ClientError`]) so callers can branch on
//! the kind without string matching.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{
    AuthorizeOptions, AuthorizeResult, Challenge, Client, ClientBuilder, Tokens, VerifyOptions,
    VerifyResult, WellKnown,
};
pub use error::ClientError;
pub use transport::{ReqwestTransport, Transport, TransportResponse};
