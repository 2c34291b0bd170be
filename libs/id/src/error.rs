//! Error types for key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The key string is empty.
    #[error("key cannot be empty")]
    Empty,

    /// A service key is missing the `/` separator.
    #[error("service key missing '/' separator")]
    MissingSeparator,

    /// The key format is invalid.
    #[error("invalid key format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        IdError::InvalidFormat {
            message: message.into(),
        }
    }
}
