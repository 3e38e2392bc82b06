use pps_ledger::LedgerError;
use pps_repo::RepoError;
use pps_types::{DatasetId, DatasetState};

use crate::config::ConfigError;

/// Errors that stop an engine operation.
///
/// Per-dataset transfer problems are not errors at this level; they are
/// recorded on the ledger entry as a [`TransferFailure`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no ledger entry for dataset {0}")]
    NotFound(DatasetId),

    #[error("cannot {action} dataset {id} in state {state}")]
    InvalidOperation {
        id: DatasetId,
        action: &'static str,
        state: DatasetState,
    },

    #[error("engine task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Fatal errors stop every periodic task; the ledger can no longer be
    /// trusted to record what happens next.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_fatal(),
            Self::Task(_) => true,
            Self::Config(_) | Self::NotFound(_) | Self::InvalidOperation { .. } => false,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Step of a transfer at which a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Export,
    Import,
    Verify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Export => "export",
            Self::Import => "import",
            Self::Verify => "verify",
        })
    }
}

/// Why one transfer attempt failed.
///
/// Every kind is retried with backoff until the attempt ceiling; the kind
/// tells operators what to look at.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    /// The repository was unreachable or slow.
    #[error("transient {stage} failure: {reason}")]
    Transient { stage: Stage, reason: String },

    /// Retrying unchanged is unlikely to help (missing at source, conflicting
    /// copy at destination).
    #[error("permanent {stage} failure: {reason}")]
    Permanent { stage: Stage, reason: String },

    /// Content did not match its fingerprint.
    #[error("integrity failure at {stage}: {reason}")]
    Integrity { stage: Stage, reason: String },
}

impl TransferFailure {
    /// Classify an adapter error raised during `stage`.
    pub fn from_repo(stage: Stage, err: &RepoError) -> Self {
        let reason = err.to_string();
        if err.is_transient() {
            return Self::Transient { stage, reason };
        }
        match (stage, err) {
            (_, RepoError::Corrupt { .. }) | (Stage::Verify, RepoError::NotFound(_)) => {
                Self::Integrity { stage, reason }
            }
            _ => Self::Permanent { stage, reason },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Integrity { .. } => "integrity",
        }
    }
}

#[cfg(test)]
mod tests {
    use pps_types::Fingerprint;

    use super::*;

    #[test]
    fn classification_follows_error_and_stage() {
        let id = DatasetId::ephemeral();
        let fp = Fingerprint::from_hash([1; 32]);

        let f = TransferFailure::from_repo(Stage::Import, &RepoError::Unavailable("down".into()));
        assert_eq!(f.kind(), "transient");
        let f = TransferFailure::from_repo(Stage::Export, &RepoError::Timeout { operation: "export" });
        assert_eq!(f.kind(), "transient");
        let f = TransferFailure::from_repo(Stage::Export, &RepoError::NotFound(id));
        assert_eq!(f.kind(), "permanent");
        let f = TransferFailure::from_repo(
            Stage::Import,
            &RepoError::Conflict {
                id,
                existing: fp,
                incoming: fp,
            },
        );
        assert_eq!(f.kind(), "permanent");
        let f = TransferFailure::from_repo(Stage::Verify, &RepoError::NotFound(id));
        assert_eq!(f.kind(), "integrity");
    }

    #[test]
    fn only_ledger_outages_are_fatal() {
        let id = DatasetId::ephemeral();
        assert!(EngineError::Ledger(LedgerError::Io("disk".into())).is_fatal());
        assert!(!EngineError::Ledger(LedgerError::NotFound(id)).is_fatal());
        assert!(!EngineError::NotFound(id).is_fatal());
    }
}
