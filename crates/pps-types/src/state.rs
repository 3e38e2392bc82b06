use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle state of a dataset in the transfer ledger.
///
/// ```text
/// Pending ──► Retrying ⟲ ──► Replicated ──► (Purgeable) ──► Purged
///    │            │               │
///    └────────────┴──► Failed     └──► Retrying   (destination lost the copy)
///                        │
///                        └──► Pending             (operator requeue)
/// ```
///
/// `Purgeable` is never stored. It is the derived view of a `Replicated`
/// entry whose retention deadline has passed, produced by
/// [`LedgerEntry::effective_state`](crate::LedgerEntry::effective_state).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatasetState {
    /// Discovered, never attempted.
    Pending,
    /// At least one attempt failed; re-claimable once its backoff elapses.
    Retrying,
    /// Verified present at the destination.
    Replicated,
    /// Replicated and past its retention deadline.
    Purgeable,
    /// Deleted from the source after replication.
    Purged,
    /// Attempt ceiling exceeded; waits for an operator.
    Failed,
}

impl DatasetState {
    pub const ALL: [DatasetState; 6] = [
        Self::Pending,
        Self::Retrying,
        Self::Replicated,
        Self::Purgeable,
        Self::Purged,
        Self::Failed,
    ];

    /// States that a ledger may persist.
    pub const STORED: [DatasetState; 5] = [
        Self::Pending,
        Self::Retrying,
        Self::Replicated,
        Self::Purged,
        Self::Failed,
    ];

    /// Returns `true` for states that no automatic component leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Purged | Self::Failed)
    }

    /// Returns `true` if a transfer worker may claim an entry in this state.
    pub fn is_transferable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Returns `true` if the state may be persisted.
    pub fn is_stored(&self) -> bool {
        !matches!(self, Self::Purgeable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Replicated => "replicated",
            Self::Purgeable => "purgeable",
            Self::Purged => "purged",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetState {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TypeError::UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DatasetState::Purged.is_terminal());
        assert!(DatasetState::Failed.is_terminal());
        assert!(!DatasetState::Replicated.is_terminal());
        assert!(!DatasetState::Pending.is_terminal());
    }

    #[test]
    fn only_pending_and_retrying_are_transferable() {
        let transferable: Vec<_> = DatasetState::ALL
            .into_iter()
            .filter(DatasetState::is_transferable)
            .collect();
        assert_eq!(transferable, vec![DatasetState::Pending, DatasetState::Retrying]);
    }

    #[test]
    fn purgeable_is_never_stored() {
        assert!(!DatasetState::Purgeable.is_stored());
        assert!(!DatasetState::STORED.contains(&DatasetState::Purgeable));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Replicated".parse::<DatasetState>().unwrap(), DatasetState::Replicated);
        assert_eq!(" failed ".parse::<DatasetState>().unwrap(), DatasetState::Failed);
        assert!("gone".parse::<DatasetState>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        for state in DatasetState::ALL {
            assert_eq!(state.to_string().parse::<DatasetState>().unwrap(), state);
        }
    }
}
