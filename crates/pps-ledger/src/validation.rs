use pps_types::{ClaimToken, DatasetId, DatasetState, LedgerEntry};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::traits::{EntryQuery, TransferLedger};

/// A broken ledger invariant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub dataset_id: DatasetId,
    pub kind: ViolationKind,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// The state machine has no edge between the two states.
    IllegalEdge,
    /// `Purgeable` is derived and may not be stored.
    DerivedState,
    /// Identity fields changed.
    IdentityChanged,
    /// `attempt_count` went down or the floor exceeds it.
    AttemptRegression,
    /// A state change was attempted without holding the entry's claim.
    ClaimRequired,
    /// A replicated or purged entry lacks its timestamps.
    MissingTimestamp,
    /// Purge before the retention deadline, or with none.
    PrematurePurge,
}

/// Check that `next` may replace `stored`.
///
/// `holder` is the claim token presented by the writer. A live claim may
/// only be renewed or replaced by its holder; another writer may replace it
/// once it has lapsed at the new claim's acquisition time. Dropping a claim
/// needs no holder, so lapsed and stuck claims can be released.
pub fn validate_transition(
    stored: &LedgerEntry,
    next: &LedgerEntry,
    holder: Option<&ClaimToken>,
) -> Result<(), Violation> {
    let violation = |kind, description: String| Violation {
        dataset_id: stored.dataset_id,
        kind,
        description,
    };

    if next.dataset_id != stored.dataset_id || next.reference != stored.reference {
        return Err(violation(
            ViolationKind::IdentityChanged,
            "dataset reference is immutable".into(),
        ));
    }
    if next.discovered_at != stored.discovered_at {
        return Err(violation(
            ViolationKind::IdentityChanged,
            "discovery time is immutable".into(),
        ));
    }
    if next.attempt_count < stored.attempt_count || next.attempt_floor > next.attempt_count {
        return Err(violation(
            ViolationKind::AttemptRegression,
            format!(
                "attempts {} (floor {}) after {}",
                next.attempt_count, next.attempt_floor, stored.attempt_count
            ),
        ));
    }
    if !next.state.is_stored() {
        return Err(violation(
            ViolationKind::DerivedState,
            format!("{} is never stored", next.state),
        ));
    }
    if !edge_allowed(stored.state, next.state) {
        return Err(violation(
            ViolationKind::IllegalEdge,
            format!("{} -> {}", stored.state, next.state),
        ));
    }

    if let Some(violation) = check_claim_change(stored, next, holder) {
        return Err(violation);
    }

    if next.state != stored.state {
        if let Some(claim) = &stored.claim {
            if holder != Some(&claim.token) {
                return Err(violation(
                    ViolationKind::ClaimRequired,
                    format!("entry is claimed by {}", claim.owner),
                ));
            }
        } else if stored.state.is_transferable() {
            return Err(violation(
                ViolationKind::ClaimRequired,
                format!("leaving {} requires a claim", stored.state),
            ));
        }
    }

    match next.state {
        DatasetState::Replicated if next.completed_at.is_none() => Err(violation(
            ViolationKind::MissingTimestamp,
            "replicated entry without completion time".into(),
        )),
        DatasetState::Purged if next.state != stored.state => {
            match (next.retention_deadline, next.purged_at) {
                (Some(deadline), Some(purged_at)) if deadline <= purged_at => Ok(()),
                (None, _) => Err(violation(
                    ViolationKind::PrematurePurge,
                    "no retention deadline (retained forever)".into(),
                )),
                (Some(_), None) => Err(violation(
                    ViolationKind::MissingTimestamp,
                    "purged entry without purge time".into(),
                )),
                (Some(deadline), Some(purged_at)) => Err(violation(
                    ViolationKind::PrematurePurge,
                    format!("purged at {purged_at}, deadline {deadline}"),
                )),
            }
        }
        _ => Ok(()),
    }
}

fn check_claim_change(
    stored: &LedgerEntry,
    next: &LedgerEntry,
    holder: Option<&ClaimToken>,
) -> Option<Violation> {
    let held = stored.claim.as_ref()?;
    let proposed = next.claim.as_ref()?;
    let is_holder = holder == Some(&held.token);
    let description = if proposed.token == held.token {
        if proposed == held {
            return None;
        }
        if !is_holder {
            format!("only the holder may renew the claim of {}", held.owner)
        } else if !held.is_valid_at(proposed.renewed_at) {
            format!("claim of {} lapsed at {}", held.owner, held.expires_at)
        } else {
            return None;
        }
    } else if !is_holder && held.is_valid_at(proposed.acquired_at) {
        format!("entry is claimed by {} until {}", held.owner, held.expires_at)
    } else {
        return None;
    };
    Some(Violation {
        dataset_id: stored.dataset_id,
        kind: ViolationKind::ClaimRequired,
        description,
    })
}

/// Check a proposed write and convert a violation into a ledger error.
pub(crate) fn check_transition(
    stored: &LedgerEntry,
    next: &LedgerEntry,
    holder: Option<&ClaimToken>,
) -> LedgerResult<()> {
    validate_transition(stored, next, holder).map_err(|v| LedgerError::InvalidTransition {
        id: v.dataset_id,
        from: stored.state,
        to: next.state,
        kind: v.kind,
        reason: v.description,
    })
}

fn edge_allowed(from: DatasetState, to: DatasetState) -> bool {
    use DatasetState::*;
    matches!(
        (from, to),
        (Pending, Pending | Retrying | Replicated | Failed)
            | (Retrying, Retrying | Replicated | Failed)
            | (Replicated, Replicated | Purged | Retrying)
            | (Failed, Failed | Pending)
    )
}

/// Result of auditing every stored entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub entries_checked: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Audits stored entries for invariants that must hold at rest.
pub struct LedgerValidator;

impl LedgerValidator {
    pub fn validate<L: TransferLedger + ?Sized>(ledger: &L) -> LedgerResult<ValidationReport> {
        let entries = ledger.scan(&EntryQuery::all())?;
        let mut report = ValidationReport {
            entries_checked: entries.len(),
            violations: Vec::new(),
        };
        for entry in &entries {
            report.violations.extend(Self::check_entry(entry));
        }
        Ok(report)
    }

    fn check_entry(entry: &LedgerEntry) -> Vec<Violation> {
        let mut found = Vec::new();
        let mut flag = |kind, description: &str| {
            found.push(Violation {
                dataset_id: entry.dataset_id,
                kind,
                description: description.to_string(),
            })
        };

        if !entry.state.is_stored() {
            flag(ViolationKind::DerivedState, "derived state stored");
        }
        if entry.attempt_floor > entry.attempt_count {
            flag(ViolationKind::AttemptRegression, "attempt floor above attempt count");
        }
        if entry.dataset_id != entry.reference.id {
            flag(ViolationKind::IdentityChanged, "key does not match reference");
        }
        match entry.state {
            DatasetState::Replicated if entry.completed_at.is_none() => {
                flag(ViolationKind::MissingTimestamp, "replicated without completion time");
            }
            DatasetState::Purged => {
                match (entry.completed_at, entry.retention_deadline, entry.purged_at) {
                    (Some(_), Some(deadline), Some(purged_at)) if deadline <= purged_at => {}
                    (_, _, None) | (None, _, _) => {
                        flag(ViolationKind::MissingTimestamp, "purged without timestamps");
                    }
                    _ => flag(ViolationKind::PrematurePurge, "purged before retention deadline"),
                }
            }
            _ => {}
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use pps_types::{Claim, DatasetRef, Fingerprint};

    use super::*;

    fn pending() -> LedgerEntry {
        let reference = DatasetRef::new(
            DatasetId::ephemeral(),
            Fingerprint::from_hash([3; 32]),
            "difference_image",
        );
        LedgerEntry::discovered(reference, Utc::now(), None)
    }

    fn claimed(entry: &LedgerEntry) -> (LedgerEntry, ClaimToken) {
        let claim = Claim::new("worker-0", Utc::now(), Duration::seconds(60));
        let token = claim.token;
        (entry.with_claim(claim), token)
    }

    #[test]
    fn claim_only_change_needs_no_holder() {
        let stored = pending();
        let (next, _) = claimed(&stored);
        assert!(validate_transition(&stored, &next, None).is_ok());
    }

    #[test]
    fn live_claim_cannot_be_taken_over() {
        let now = Utc::now();
        let (stored, token) = claimed(&pending());
        let rival = Claim::new("worker-1", now + Duration::seconds(30), Duration::seconds(60));

        let err = validate_transition(&stored, &stored.with_claim(rival.clone()), None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);
        assert!(validate_transition(&stored, &stored.with_claim(rival), Some(&token)).is_ok());

        let late = Claim::new("worker-1", now + Duration::seconds(61), Duration::seconds(60));
        assert!(validate_transition(&stored, &stored.with_claim(late), None).is_ok());
    }

    #[test]
    fn renewal_needs_the_holder_and_a_live_claim() {
        let now = Utc::now();
        let (stored, token) = claimed(&pending());
        let ttl = Duration::seconds(60);

        let renewed = stored.with_renewed_claim(now + Duration::seconds(20), ttl);
        assert!(validate_transition(&stored, &renewed, Some(&token)).is_ok());
        let err = validate_transition(&stored, &renewed, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);

        let lapsed = stored.with_renewed_claim(now + Duration::seconds(90), ttl);
        let err = validate_transition(&stored, &lapsed, Some(&token)).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);
    }

    #[test]
    fn any_writer_may_release_a_claim() {
        let (stored, _) = claimed(&pending());
        assert!(validate_transition(&stored, &stored.without_claim(), None).is_ok());
    }

    #[test]
    fn replication_requires_the_claim_holder() {
        let now = Utc::now();
        let (stored, token) = claimed(&pending());
        let next = stored.begin_attempt(now).replicated(now, Some(Duration::hours(1)));

        assert!(validate_transition(&stored, &next, Some(&token)).is_ok());
        let err = validate_transition(&stored, &next, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);
        let err = validate_transition(&stored, &next, Some(&ClaimToken::new())).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);
    }

    #[test]
    fn leaving_pending_without_claim_is_rejected() {
        let stored = pending();
        let next = stored.attempt_failed("x", None);
        let err = validate_transition(&stored, &next, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ClaimRequired);
    }

    #[test]
    fn pending_cannot_jump_to_purged() {
        let now = Utc::now();
        let (stored, token) = claimed(&pending());
        let next = stored.purged(now);
        let err = validate_transition(&stored, &next, Some(&token)).unwrap_err();
        assert_eq!(err.kind, ViolationKind::IllegalEdge);
    }

    #[test]
    fn purge_before_deadline_is_rejected() {
        let now = Utc::now();
        let replicated = pending().replicated(now, Some(Duration::hours(24)));
        let (replicated, token2) = claimed(&replicated);

        let early = replicated.purged(now + Duration::hours(1));
        let err = validate_transition(&replicated, &early, Some(&token2)).unwrap_err();
        assert_eq!(err.kind, ViolationKind::PrematurePurge);

        let late = replicated.purged(now + Duration::hours(24));
        assert!(validate_transition(&replicated, &late, Some(&token2)).is_ok());
    }

    #[test]
    fn retained_forever_cannot_be_purged() {
        let now = Utc::now();
        let (replicated, token) = claimed(&pending().replicated(now, None));
        let next = replicated.purged(now + Duration::days(3650));
        let err = validate_transition(&replicated, &next, Some(&token)).unwrap_err();
        assert_eq!(err.kind, ViolationKind::PrematurePurge);
    }

    #[test]
    fn purgeable_is_never_stored() {
        let stored = pending();
        let mut next = stored.clone();
        next.state = DatasetState::Purgeable;
        let err = validate_transition(&stored, &next, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DerivedState);
    }

    #[test]
    fn attempt_count_cannot_decrease() {
        let now = Utc::now();
        let stored = pending().begin_attempt(now);
        let mut next = stored.clone();
        next.attempt_count = 0;
        let err = validate_transition(&stored, &next, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::AttemptRegression);
    }

    #[test]
    fn requeue_of_failed_entry_is_allowed() {
        let now = Utc::now();
        let (stored, token) = claimed(&pending());
        let failed = stored.begin_attempt(now).attempt_failed("gone", None);
        assert!(validate_transition(&stored, &failed, Some(&token)).is_ok());
        let requeued = failed.requeued(now);
        assert!(validate_transition(&failed, &requeued, None).is_ok());
    }

    #[test]
    fn purged_is_terminal() {
        let now = Utc::now();
        let purged = pending()
            .replicated(now, Some(Duration::zero()))
            .purged(now);
        let revived = purged.demoted(now, "try again");
        let err = validate_transition(&purged, &revived, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::IllegalEdge);
    }

    #[test]
    fn reference_is_immutable() {
        let stored = pending();
        let mut next = stored.clone();
        next.reference.fingerprint = Fingerprint::from_hash([9; 32]);
        let err = validate_transition(&stored, &next, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::IdentityChanged);
    }
}
