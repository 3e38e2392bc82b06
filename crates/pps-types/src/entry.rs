use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::dataset::{DatasetId, DatasetRef};
use crate::state::DatasetState;

/// Authoritative lifecycle record of one dataset.
///
/// Entries are values: every lifecycle step below returns a modified copy,
/// and only a ledger's compare-and-set makes that copy the truth. The
/// `version` field is owned by the ledger and bumped on every accepted write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub dataset_id: DatasetId,
    pub reference: DatasetRef,
    pub state: DatasetState,
    pub discovered_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
    /// Number of transfer attempts ever started. Never decreases.
    pub attempt_count: u32,
    /// `attempt_count` at the last requeue or demotion; the attempt ceiling
    /// applies to attempts made after it.
    pub attempt_floor: u32,
    /// Diagnostic only.
    pub last_error: Option<String>,
    /// `completed_at + retention window`. `None` on a replicated entry means
    /// the dataset is kept at the source forever.
    pub retention_deadline: Option<DateTime<Utc>>,
    /// Earliest time a transfer worker may claim the entry.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claim: Option<Claim>,
    /// How many times the destination copy was found missing after replication.
    pub demotions: u32,
    pub version: u64,
}

impl LedgerEntry {
    /// A fresh `Pending` entry for a newly discovered dataset.
    pub fn discovered(
        reference: DatasetRef,
        now: DateTime<Utc>,
        eligible_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            dataset_id: reference.id,
            reference,
            state: DatasetState::Pending,
            discovered_at: now,
            last_attempt_at: None,
            completed_at: None,
            purged_at: None,
            attempt_count: 0,
            attempt_floor: 0,
            last_error: None,
            retention_deadline: None,
            next_attempt_at: eligible_at,
            claim: None,
            demotions: 0,
            version: 0,
        }
    }

    /// The state as observed at `now`, with `Purgeable` derived from the
    /// retention deadline.
    pub fn effective_state(&self, now: DateTime<Utc>) -> DatasetState {
        if self.is_purge_due_at(now) {
            DatasetState::Purgeable
        } else {
            self.state
        }
    }

    /// Returns `true` if a claim is held and has not lapsed.
    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.is_valid_at(now))
    }

    /// Returns `true` if a claim is recorded but has lapsed.
    pub fn has_expired_claim_at(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| !c.is_valid_at(now))
    }

    /// Returns `true` if the entry's backoff or embargo has elapsed.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Returns `true` if a transfer worker may claim the entry at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_transferable() && !self.is_claimed_at(now) && self.is_due_at(now)
    }

    /// Returns `true` if the entry is replicated and its retention deadline
    /// has passed.
    pub fn is_purge_due_at(&self, now: DateTime<Utc>) -> bool {
        self.state == DatasetState::Replicated
            && self.retention_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Attempts counted against the ceiling.
    pub fn attempts_since_requeue(&self) -> u32 {
        self.attempt_count.saturating_sub(self.attempt_floor)
    }

    pub fn with_claim(&self, claim: Claim) -> Self {
        Self {
            claim: Some(claim),
            ..self.clone()
        }
    }

    pub fn with_renewed_claim(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            claim: self.claim.as_ref().map(|c| c.renewed(now, ttl)),
            ..self.clone()
        }
    }

    pub fn without_claim(&self) -> Self {
        Self {
            claim: None,
            ..self.clone()
        }
    }

    /// Record the start of a transfer attempt.
    pub fn begin_attempt(&self, now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            last_attempt_at: Some(now),
            ..self.clone()
        }
    }

    /// Verified at the destination. `window` of `None` retains forever.
    pub fn replicated(&self, now: DateTime<Utc>, window: Option<Duration>) -> Self {
        Self {
            state: DatasetState::Replicated,
            completed_at: Some(now),
            retention_deadline: window.map(|w| now + w),
            next_attempt_at: None,
            last_error: None,
            claim: None,
            ..self.clone()
        }
    }

    /// A transfer attempt failed. With `retry_at` the entry goes back to
    /// `Retrying`; without it the entry is `Failed`.
    pub fn attempt_failed(&self, error: impl Into<String>, retry_at: Option<DateTime<Utc>>) -> Self {
        let state = if retry_at.is_some() {
            DatasetState::Retrying
        } else {
            DatasetState::Failed
        };
        Self {
            state,
            last_error: Some(error.into()),
            next_attempt_at: retry_at,
            claim: None,
            ..self.clone()
        }
    }

    /// Deletion from the source confirmed.
    pub fn purged(&self, now: DateTime<Utc>) -> Self {
        Self {
            state: DatasetState::Purged,
            purged_at: Some(now),
            claim: None,
            ..self.clone()
        }
    }

    /// The destination no longer holds a matching copy: send the entry back
    /// for re-replication with a fresh attempt budget.
    pub fn demoted(&self, now: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            state: DatasetState::Retrying,
            completed_at: None,
            retention_deadline: None,
            next_attempt_at: Some(now),
            last_error: Some(reason.into()),
            attempt_floor: self.attempt_count,
            demotions: self.demotions.saturating_add(1),
            claim: None,
            ..self.clone()
        }
    }

    /// Operator requeue of a `Failed` entry.
    pub fn requeued(&self, now: DateTime<Utc>) -> Self {
        Self {
            state: DatasetState::Pending,
            next_attempt_at: Some(now),
            last_error: None,
            attempt_floor: self.attempt_count,
            claim: None,
            ..self.clone()
        }
    }
}
