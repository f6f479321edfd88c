//! Error types for replication.

use crate::report::ReplicationReport;
use docsync_store::StoreError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during a replication pass.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The options are malformed. Raised before any store is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store failed in a way that prevents the whole pass, such as
    /// enumeration.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Another pass of the same replicator is still running.
    #[error("replication already running")]
    AlreadyRunning,

    /// The pass was cancelled by the caller.
    #[error("replication cancelled")]
    Cancelled,

    /// Some ids could not be reconciled. Every other id is settled.
    #[error(
        "replication incomplete: {} failed, first: {}",
        .report.failures().len(),
        .report.failures().first().map(ToString::to_string).unwrap_or_default()
    )]
    Incomplete {
        /// Full report of the pass, including the failed ids.
        report: Box<ReplicationReport>,
    },
}

impl ReplicationError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns the pass report carried by a partial failure.
    #[must_use]
    pub fn report(&self) -> Option<&ReplicationReport> {
        match self {
            Self::Incomplete { report } => Some(&**report),
            _ => None,
        }
    }

    /// Returns true if running the pass again may succeed without any
    /// change on either side.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::AlreadyRunning | Self::Cancelled => true,
            Self::Incomplete { report } => report
                .failures()
                .iter()
                .all(|failure| failure.reason.is_retryable()),
            Self::Configuration(_) => false,
        }
    }
}
