use chrono::{DateTime, Utc};
use pps_types::{ClaimToken, DatasetId, DatasetRef, DatasetState, LedgerEntry};

use crate::error::LedgerResult;

/// Selection of ledger entries for [`TransferLedger::scan`].
///
/// Results are ordered by dataset id. `after` resumes a scan past the last
/// id seen, so callers can walk the ledger in batches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryQuery {
    /// Stored states to include; empty means any state.
    pub states: Vec<DatasetState>,
    pub after: Option<DatasetId>,
    pub limit: Option<usize>,
    /// Only entries a transfer worker may claim at this instant.
    pub claimable_at: Option<DateTime<Utc>>,
    /// Only replicated entries whose retention deadline has passed.
    pub purge_due_at: Option<DateTime<Utc>>,
    /// Only entries carrying a claim that lapsed before this instant.
    pub claim_expired_at: Option<DateTime<Utc>>,
    /// Only entries carrying a claim that is still live at this instant.
    pub claim_live_at: Option<DateTime<Utc>>,
    /// Only entries whose claim was acquired at or before this instant.
    pub claim_acquired_by: Option<DateTime<Utc>>,
}

impl EntryQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(states: impl IntoIterator<Item = DatasetState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn claimable(now: DateTime<Utc>) -> Self {
        Self {
            claimable_at: Some(now),
            ..Self::default()
        }
    }

    pub fn purge_due(now: DateTime<Utc>) -> Self {
        Self {
            purge_due_at: Some(now),
            ..Self::default()
        }
    }

    pub fn expired_claims(now: DateTime<Utc>) -> Self {
        Self {
            claim_expired_at: Some(now),
            ..Self::default()
        }
    }

    /// Live claims acquired at or before `acquired_by`.
    pub fn stuck_claims(now: DateTime<Utc>, acquired_by: DateTime<Utc>) -> Self {
        Self {
            claim_live_at: Some(now),
            claim_acquired_by: Some(acquired_by),
            ..Self::default()
        }
    }

    pub fn after(mut self, id: DatasetId) -> Self {
        self.after = Some(id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if the entry satisfies every filter except `limit`.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if !self.states.is_empty() && !self.states.contains(&entry.state) {
            return false;
        }
        if self.after.is_some_and(|after| entry.dataset_id <= after) {
            return false;
        }
        if self.claimable_at.is_some_and(|now| !entry.is_claimable_at(now)) {
            return false;
        }
        if self.purge_due_at.is_some_and(|now| !entry.is_purge_due_at(now)) {
            return false;
        }
        if self
            .claim_expired_at
            .is_some_and(|now| !entry.has_expired_claim_at(now))
        {
            return false;
        }
        if self.claim_live_at.is_some_and(|now| !entry.is_claimed_at(now)) {
            return false;
        }
        if let Some(by) = self.claim_acquired_by {
            if !entry.claim.as_ref().is_some_and(|c| c.acquired_at <= by) {
                return false;
            }
        }
        true
    }
}

/// Durable record of every dataset's replication and lifecycle state.
///
/// Entries are never deleted. The only mutation is
/// [`compare_and_swap`](TransferLedger::compare_and_swap), which succeeds
/// only if the caller read the latest version and the transition is legal.
pub trait TransferLedger: Send + Sync {
    /// Insert a `Pending` entry for `reference` unless one already exists.
    /// Returns `true` if the entry was created.
    fn register(
        &self,
        reference: &DatasetRef,
        discovered_at: DateTime<Utc>,
        eligible_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool>;

    fn get(&self, id: &DatasetId) -> LedgerResult<Option<LedgerEntry>>;

    fn scan(&self, query: &EntryQuery) -> LedgerResult<Vec<LedgerEntry>>;

    /// Replace `current` with `next` if the stored entry still has
    /// `current.version`. `holder` is the claim token the writer holds, if
    /// any. Returns the stored entry with its new version.
    fn compare_and_swap(
        &self,
        current: &LedgerEntry,
        next: LedgerEntry,
        holder: Option<&ClaimToken>,
    ) -> LedgerResult<LedgerEntry>;

    fn len(&self) -> LedgerResult<usize>;

    fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.len()? == 0)
    }
}
