//! Storage error types.

/// Errors that can occur in storage adapters.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend rejected or failed the operation.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// A stored value could not be (de)serialized.
    #[error("Encoding error: {message}")]
    Encoding {
        /// Description of the encoding failure.
        message: String,
    },

    /// The adapter cannot serve a prefix scan of this shape.
    #[error("Unsupported scan: {message}")]
    UnsupportedScan {
        /// Why the scan cannot be served.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new `Encoding` error.
    #[must_use]
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Creates a new `UnsupportedScan` error.
    #[must_use]
    pub fn unsupported_scan(message: impl Into<String>) -> Self {
        Self::UnsupportedScan {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::encoding(err.to_string())
    }
}
