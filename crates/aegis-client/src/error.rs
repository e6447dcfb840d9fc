//! Client error values.

/// Errors returned by the client library.
///
/// These are structured values rather than opaque messages so callers can
/// branch: an `InvalidRefreshToken` during a background refresh usually
/// means "log the user out", while a `Transport` failure is retryable.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The authorization code was rejected by the issuer.
    #[error("Invalid authorization code")]
    InvalidAuthorizationCode,

    /// The refresh token was rejected by the issuer.
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    /// The access token failed local validation.
    #[error("Invalid access token: {message}")]
    InvalidAccessToken {
        /// Description of the validation failure.
        message: String,
    },

    /// The access token is past its expiry.
    ///
    /// Kept distinct from [`Self::InvalidAccessToken`] so `verify` can
    /// branch into a silent refresh on exactly this condition.
    #[error("Access token expired")]
    TokenExpired,

    /// The token's subject failed the registered schema.
    #[error("Invalid subject: {message}")]
    InvalidSubject {
        /// Description of the schema failure.
        message: String,
    },

    /// The HTTP transport failed.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The issuer answered in an unexpected shape.
    #[error("Issuer error: {message}")]
    Issuer {
        /// Description of the protocol failure.
        message: String,
    },
}

impl ClientError {
    /// Creates a new `InvalidAccessToken` error.
    #[must_use]
    pub fn invalid_access_token(message: impl Into<String>) -> Self {
        Self::InvalidAccessToken {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidSubject` error.
    #[must_use]
    pub fn invalid_subject(message: impl Into<String>) -> Self {
        Self::InvalidSubject {
            message: message.into(),
        }
    }

    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new `Issuer` error.
    #[must_use]
    pub fn issuer(message: impl Into<String>) -> Self {
        Self::Issuer {
            message: message.into(),
        }
    }

    /// Returns `true` for token-validity errors (as opposed to transport or
    /// protocol failures).
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAuthorizationCode
                | Self::InvalidRefreshToken
                | Self::InvalidAccessToken { .. }
                | Self::TokenExpired
                | Self::InvalidSubject { .. }
        )
    }
}
