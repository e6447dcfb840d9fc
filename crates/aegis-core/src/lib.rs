//! # aegis-core
//!
//! Shared types for the aegis identity issuer and its client library.
//!
//! This crate provides:
//! - The OAuth 2.0 error taxonomy used across the issuer and client
//! - Subject schemas and the subject registry
//! - Scope parsing and narrowing
//!
//! ## Modules
//!
//! - [`error`] - Error types with RFC 6749 error-code mappings
//! - [`subject`] - Typed subjects and their validation schemas
//! - [`scope`] - Space-delimited scope strings and the narrowing rule
//! - [`pkce`] - RFC 7636 code challenge generation and verification

pub mod error;
pub mod jwk;
pub mod pkce;
pub mod scope;
pub mod subject;

pub use error::{AuthError, ErrorCategory};
pub use jwk::{Jwk, Jwks};
pub use pkce::{PkceError, PkceMethod};
pub use scope::{parse_scopes, validate_scopes};
pub use subject::{Subject, SubjectError, SubjectRegistry, SubjectSchema, TypedSchema};

/// Type alias for results in authentication/authorization code paths.
pub type AuthResult<T> = Result<T, AuthError>;
