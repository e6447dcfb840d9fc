//! Error types shared by the issuer and the client library.
//!
//! Two layers are folded into one enum: the OAuth-protocol errors that map
//! onto RFC 6749 §5.2 error codes, and the internal token errors
//! (`InvalidAccessToken`, `UnknownState`, ...) that callers of the client
//! library branch on.

use std::fmt;

/// Errors that can occur during authentication and authorization operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request is missing a parameter, repeats one, or is otherwise malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// Client authentication failed or the client is not registered.
    #[error("Invalid client: {message}")]
    InvalidClient {
        /// Description of why the client is invalid.
        message: String,
    },

    /// The grant (authorization code or refresh token) is invalid, expired, or consumed.
    #[error("Invalid grant: {message}")]
    InvalidGrant {
        /// Description of why the grant is invalid.
        message: String,
    },

    /// The requested scope is malformed or exceeds what was authorized.
    #[error("Invalid scope: {message}")]
    InvalidScope {
        /// Description of why the scope is invalid.
        message: String,
    },

    /// The client/redirect pair was rejected by the authorization guard.
    #[error("Unauthorized client {client_id} for redirect {redirect_uri}")]
    UnauthorizedClient {
        /// The rejected client ID.
        client_id: String,
        /// The rejected redirect URI.
        redirect_uri: String,
    },

    /// The resource owner or the issuer denied the request.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Description of why access was denied.
        message: String,
    },

    /// The `response_type` is not one of `code` or `token`.
    #[error("Unsupported response type: {response_type}")]
    UnsupportedResponseType {
        /// The unsupported response type.
        response_type: String,
    },

    /// The `grant_type` is not supported by the token endpoint.
    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType {
        /// The unsupported grant type.
        grant_type: String,
    },

    /// The access token failed signature, claim, or schema validation.
    #[error("Invalid access token: {message}")]
    InvalidAccessToken {
        /// Description of the validation failure.
        message: String,
    },

    /// The refresh token is malformed, unknown, or was already rotated away.
    #[error("Invalid refresh token: {message}")]
    InvalidRefreshToken {
        /// Description of the validation failure.
        message: String,
    },

    /// The authorization code is unknown, expired, or already exchanged.
    #[error("Invalid authorization code")]
    InvalidAuthorizationCode,

    /// The subject properties failed the registered schema.
    #[error("Invalid subject: {message}")]
    InvalidSubject {
        /// Description of the schema failure.
        message: String,
    },

    /// The browser lost its conversation cookie mid-flow.
    #[error(
        "The browser was in an unknown state. This can happen if certain cookies expired \
         or the browser was switched in the middle of an authentication flow"
    )]
    UnknownState,

    /// A required request parameter was absent.
    #[error("Missing parameter: {name}")]
    MissingParameter {
        /// Name of the missing parameter.
        name: String,
    },

    /// The storage adapter failed; detail is never surfaced to clients.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure (logged, not returned).
        message: String,
    },

    /// An unexpected internal failure.
    #[error("Server error: {message}")]
    ServerError {
        /// Description of the internal failure.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClient` error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidGrant` error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidScope` error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope {
            message: message.into(),
        }
    }

    /// Creates a new `UnauthorizedClient` error.
    #[must_use]
    pub fn unauthorized_client(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self::UnauthorizedClient {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Creates a new `AccessDenied` error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a new `UnsupportedResponseType` error.
    #[must_use]
    pub fn unsupported_response_type(response_type: impl Into<String>) -> Self {
        Self::UnsupportedResponseType {
            response_type: response_type.into(),
        }
    }

    /// Creates a new `UnsupportedGrantType` error.
    #[must_use]
    pub fn unsupported_grant_type(grant_type: impl Into<String>) -> Self {
        Self::UnsupportedGrantType {
            grant_type: grant_type.into(),
        }
    }

    /// Creates a new `InvalidAccessToken` error.
    #[must_use]
    pub fn invalid_access_token(message: impl Into<String>) -> Self {
        Self::InvalidAccessToken {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRefreshToken` error.
    #[must_use]
    pub fn invalid_refresh_token(message: impl Into<String>) -> Self {
        Self::InvalidRefreshToken {
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

    /// Creates a new `MissingParameter` error.
    #[must_use]
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `ServerError` error.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::ServerError { .. })
    }

    /// Returns `true` if this is a token validation error.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAccessToken { .. }
                | Self::InvalidRefreshToken { .. }
                | Self::InvalidAuthorizationCode
        )
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest { .. }
            | Self::MissingParameter { .. }
            | Self::UnsupportedResponseType { .. }
            | Self::UnsupportedGrantType { .. } => ErrorCategory::Validation,
            Self::InvalidClient { .. }
            | Self::InvalidGrant { .. }
            | Self::UnauthorizedClient { .. }
            | Self::UnknownState => ErrorCategory::Authentication,
            Self::InvalidScope { .. } | Self::AccessDenied { .. } => ErrorCategory::Authorization,
            Self::InvalidAccessToken { .. }
            | Self::InvalidRefreshToken { .. }
            | Self::InvalidAuthorizationCode
            | Self::InvalidSubject { .. } => ErrorCategory::Token,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::ServerError { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the OAuth 2.0 error code (RFC 6749 §5.2) for this error.
    ///
    /// Storage failures map to `server_error` without further detail.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } | Self::MissingParameter { .. } => "invalid_request",
            Self::InvalidClient { .. } => "invalid_client",
            Self::InvalidGrant { .. }
            | Self::InvalidRefreshToken { .. }
            | Self::InvalidAuthorizationCode => "invalid_grant",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::UnauthorizedClient { .. } => "unauthorized_client",
            Self::AccessDenied { .. } => "access_denied",
            Self::UnsupportedResponseType { .. } => "unsupported_response_type",
            Self::UnsupportedGrantType { .. } => "unsupported_grant_type",
            Self::InvalidAccessToken { .. } | Self::InvalidSubject { .. } | Self::UnknownState => {
                "invalid_request"
            }
            Self::Storage { .. } | Self::ServerError { .. } => "server_error",
        }
    }

    /// Returns the HTTP status code used when this error is returned as JSON.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidClient { .. } => 401,
            Self::Storage { .. } | Self::ServerError { .. } => 500,
            _ => 400,
        }
    }
}

/// Categories of errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Request validation errors.
    Validation,
    /// Identity verification errors.
    Authentication,
    /// Permission errors.
    Authorization,
    /// Token validation errors.
    Token,
    /// Storage-adapter failures.
    Infrastructure,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::Token => write!(f, "token"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
