//! Error types for store operations.

use crate::store::Capability;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document or attachment does not exist.
    #[error("{}", not_found_message(.id, .attachment.as_deref()))]
    NotFound {
        /// Document id.
        id: String,
        /// Attachment name, when the missing item is an attachment.
        attachment: Option<String>,
    },

    /// The store refused the write because of a concurrent change.
    #[error("conflicting write on document {id}")]
    Conflict {
        /// Document id.
        id: String,
    },

    /// The store could not be reached or failed transiently.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
        /// Whether the operation may succeed if retried.
        retryable: bool,
    },

    /// The store does not implement the requested capability.
    #[error("store does not support {0}")]
    Unsupported(Capability),

    /// The request was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal store error.
    #[error("internal store error: {0}")]
    Internal(String),
}

fn not_found_message(id: &str, attachment: Option<&str>) -> String {
    match attachment {
        Some(name) => format!("Cannot find attachment: {id} , {name}"),
        None => format!("Cannot find document: {id}"),
    }
}

impl StoreError {
    /// Creates a not-found error for a document.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            attachment: None,
        }
    }

    /// Creates a not-found error for an attachment.
    pub fn attachment_not_found(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            attachment: Some(name.into()),
        }
    }

    /// Creates a retryable unavailability error.
    pub fn unavailable_retryable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable unavailability error.
    pub fn unavailable_fatal(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the error reports a missing document or attachment.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable {
                retryable: true,
                ..
            }
        )
    }
}
