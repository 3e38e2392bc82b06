use pps_types::{DatasetId, DatasetState};

use crate::validation::ViolationKind;

/// Errors produced by ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger entry for dataset {0}")]
    NotFound(DatasetId),

    /// The entry changed since it was read; re-read and decide again.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: DatasetId,
        expected: u64,
        actual: u64,
    },

    #[error("illegal transition of {id} from {from} to {to} ({kind:?}): {reason}")]
    InvalidTransition {
        id: DatasetId,
        from: DatasetState,
        to: DatasetState,
        kind: ViolationKind,
        reason: String,
    },

    /// The ledger cannot accept reads or writes (poisoned lock, closed journal).
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Another opener holds the journal's lock file.
    #[error("ledger journal {0} is in use by another process")]
    Locked(String),

    #[error("journal I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Returns `true` for errors caused by a concurrent writer, which the
    /// caller resolves by re-reading the entry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Returns `true` if the ledger itself is unusable. Callers must stop
    /// rather than act on possibly-lost lifecycle truth.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Locked(_) | Self::Io(_) | Self::Serialization(_)
        )
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let id = DatasetId::ephemeral();
        assert!(LedgerError::VersionConflict {
            id,
            expected: 1,
            actual: 2
        }
        .is_conflict());
        assert!(LedgerError::Io("disk full".into()).is_fatal());
        assert!(LedgerError::Locked("ledger.journal".into()).is_fatal());
        assert!(!LedgerError::NotFound(id).is_fatal());
        assert!(!LedgerError::NotFound(id).is_conflict());
    }
}
