//! Error types for the staging pipeline.
//!
//! Errors fall into the classes the pipeline treats differently:
//! transient infrastructure failures are retried by the job runner, invalid
//! deposit data is fatal for the deposit (the cursor stays put and the next
//! scheduling tick retries it), and ordering violations indicate corrupted
//! cursor state that needs an operator.

use chrono::{DateTime, Utc};

/// The result type used throughout escrow-staging.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while staging deposits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A revision was appended out of commit-time order.
    #[error("revision for {key} at {commit_time} is not after {latest}")]
    RevisionOrder {
        /// Resource whose history was being appended.
        key: String,
        /// Commit time of the rejected revision.
        commit_time: DateTime<Utc>,
        /// Commit time of the latest stored revision.
        latest: DateTime<Utc>,
    },

    /// A cursor CAS kept losing races.
    #[error("cursor {path} contended after {attempts} attempts")]
    CursorContention {
        /// Storage path of the cursor.
        path: String,
        /// Number of CAS attempts made.
        attempts: u32,
    },

    /// A deposit completed for a watermark the cursor is not positioned at.
    #[error(
        "partial ordering of deposits broken for {tld}/{cursor_type}: cursor at {position}, deposit watermark {watermark}"
    )]
    CursorOrdering {
        /// TLD of the cursor.
        tld: String,
        /// Cursor type name.
        cursor_type: String,
        /// Current cursor position.
        position: DateTime<Utc>,
        /// Watermark of the completing deposit.
        watermark: DateTime<Utc>,
    },

    /// One or more snapshots failed schema validation; the deposit is dropped.
    #[error("deposit {deposit} has {failures} invalid resource(s)")]
    InvalidDeposit {
        /// Deposit key in display form.
        deposit: String,
        /// Number of snapshots that failed to marshal.
        failures: usize,
    },

    /// Encrypting or decrypting an artifact failed.
    #[error("encryption error: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },

    /// The upload queue rejected an enqueue.
    #[error("enqueue error: {message}")]
    Enqueue {
        /// Description of the failure.
        message: String,
    },

    /// A map or reduce task exhausted its attempts.
    #[error("task {task} failed after {attempts} attempt(s): {message}")]
    TaskFailed {
        /// Task label.
        task: String,
        /// Attempts made.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// An error from escrow-core.
    #[error("core error: {0}")]
    Core(#[from] escrow_core::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true when the job runner should re-execute the failed task.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { .. } | Self::CursorContention { .. } | Self::Enqueue { .. } => true,
            Self::Core(inner) => inner.is_transient(),
            Self::Configuration { .. }
            | Self::Serialization { .. }
            | Self::RevisionOrder { .. }
            | Self::CursorOrdering { .. }
            | Self::InvalidDeposit { .. }
            | Self::Encryption { .. }
            | Self::TaskFailed { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_failures_are_transient() {
        assert!(Error::storage("down").is_transient());
        assert!(
            Error::Enqueue {
                message: "queue full".into()
            }
            .is_transient()
        );
        assert!(Error::from(escrow_core::Error::storage("timeout")).is_transient());
    }

    #[test]
    fn data_failures_are_fatal() {
        let err = Error::InvalidDeposit {
            deposit: "example/full/2024-01-01T00:00:00Z".into(),
            failures: 2,
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("2 invalid"));
        assert!(!Error::configuration("missing key").is_transient());
    }
}
