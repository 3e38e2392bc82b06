use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pps_types::{DatasetId, DatasetState};
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::traits::{EntryQuery, TransferLedger};

/// Point-in-time summary of the ledger, by effective state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub as_of: DateTime<Utc>,
    pub total: usize,
    /// Counts per effective state; `Purgeable` is derived at `as_of`.
    pub by_state: BTreeMap<DatasetState, usize>,
    /// Entries whose claim is currently valid.
    pub claimed: usize,
    /// Entries carrying a lapsed claim, awaiting the reconciler.
    pub expired_claims: usize,
    /// Transferable entries waiting on backoff or embargo.
    pub waiting: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Total demotions recorded across all entries.
    pub demotions: u64,
    /// Failed entries with their last error, for operator attention.
    pub failures: Vec<(DatasetId, Option<String>)>,
}

impl LedgerStats {
    pub fn count(&self, state: DatasetState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Deterministic summaries built from a full ledger scan.
pub struct ProjectionBuilder;

impl ProjectionBuilder {
    pub fn stats<L: TransferLedger + ?Sized>(ledger: &L, now: DateTime<Utc>) -> LedgerResult<LedgerStats> {
        let entries = ledger.scan(&EntryQuery::all())?;
        let mut by_state: BTreeMap<DatasetState, usize> =
            DatasetState::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stats = LedgerStats {
            as_of: now,
            total: entries.len(),
            by_state: BTreeMap::new(),
            claimed: 0,
            expired_claims: 0,
            waiting: 0,
            oldest_pending: None,
            demotions: 0,
            failures: Vec::new(),
        };

        for entry in &entries {
            *by_state.entry(entry.effective_state(now)).or_default() += 1;
            if entry.is_claimed_at(now) {
                stats.claimed += 1;
            } else if entry.has_expired_claim_at(now) {
                stats.expired_claims += 1;
            }
            if entry.state.is_transferable() && !entry.is_due_at(now) {
                stats.waiting += 1;
            }
            if entry.state == DatasetState::Pending {
                stats.oldest_pending = Some(match stats.oldest_pending {
                    Some(oldest) => oldest.min(entry.discovered_at),
                    None => entry.discovered_at,
                });
            }
            stats.demotions += u64::from(entry.demotions);
            if entry.state == DatasetState::Failed {
                stats.failures.push((entry.dataset_id, entry.last_error.clone()));
            }
        }

        stats.by_state = by_state;
        Ok(stats)
    }
}
