//! PKCE (Proof Key for Code Exchange, RFC 7636), S256 method only.
//!
//! The `plain` method is rejected: a challenge that equals its verifier
//! defeats the purpose of the exchange, and every upstream this issuer
//! fronts supports S256.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Default number of random bytes in a generated verifier; base64url brings
/// the encoded form to 86 characters, inside the 43-128 range.
const VERIFIER_BYTES: usize = 64;

/// Errors that can occur during PKCE operations.
#[derive(Debug, thiserror::Error)]
pub enum PkceError {
    /// Verifier length is outside the RFC 7636 range (43-128 characters).
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier contains characters outside `[A-Za-z0-9-._~]`.
    #[error("Invalid verifier characters")]
    InvalidVerifierCharacters,

    /// Only the S256 method is supported.
    #[error("Unsupported challenge method: {0}")]
    UnsupportedMethod(String),

    /// The verifier does not hash to the recorded challenge.
    #[error("Code verifier does not match challenge")]
    VerificationFailed,
}

/// PKCE challenge method. Only S256 is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PkceMethod {
    /// SHA-256 (`BASE64URL(SHA256(ASCII(code_verifier)))`).
    #[default]
    S256,
}

impl PkceMethod {
    /// Parses a `code_challenge_method` parameter.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::UnsupportedMethod` for anything but `"S256"`,
    /// including `"plain"`.
    pub fn parse(method: &str) -> Result<Self, PkceError> {
        match method {
            "S256" => Ok(Self::S256),
            other => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Returns the method name as used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        "S256"
    }
}

impl std::fmt::Display for PkceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generates a random code verifier and its S256 challenge.
///
/// Returns `(verifier, challenge)`.
#[must_use]
pub fn generate() -> (String, String) {
    use rand::RngCore;
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    (verifier, challenge)
}

/// Computes the S256 challenge for a verifier.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Validates a verifier's shape per RFC 7636 §4.1.
///
/// # Errors
///
/// Returns an error for out-of-range lengths or invalid characters.
pub fn validate_verifier(verifier: &str) -> Result<(), PkceError> {
    let len = verifier.len();
    if !(43..=128).contains(&len) {
        return Err(PkceError::InvalidVerifierLength(len));
    }
    if !verifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(PkceError::InvalidVerifierCharacters);
    }
    Ok(())
}

/// Verifies a code verifier against a recorded challenge.
///
/// The comparison is constant-time.
///
/// # Errors
///
/// Returns `PkceError::VerificationFailed` when the verifier does not hash to
/// the challenge, or a shape error for malformed verifiers.
pub fn verify(challenge: &str, verifier: &str, method: PkceMethod) -> Result<(), PkceError> {
    let PkceMethod::S256 = method;
    validate_verifier(verifier)?;
    let computed = challenge_for(verifier);
    if computed.as_bytes().ct_eq(challenge.as_bytes()).into() {
        Ok(())
    } else {
        Err(PkceError::VerificationFailed)
    }
}
