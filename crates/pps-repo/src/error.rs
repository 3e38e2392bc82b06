use pps_types::{DatasetId, Fingerprint};

/// Errors from repository adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The dataset does not exist in this repository.
    #[error("dataset not found: {0}")]
    NotFound(DatasetId),

    /// A different dataset is already stored under the same identifier.
    #[error("conflicting dataset {id}: stored {existing}, incoming {incoming}")]
    Conflict {
        id: DatasetId,
        existing: Fingerprint,
        incoming: Fingerprint,
    },

    /// The repository cannot be reached right now.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within its deadline.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored dataset is malformed or cannot be decoded.
    #[error("corrupt dataset {id}: {reason}")]
    Corrupt { id: DatasetId, reason: String },
}

impl RepoError {
    /// Returns `true` for failures that may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Returns `true` if the error reports a missing dataset.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
