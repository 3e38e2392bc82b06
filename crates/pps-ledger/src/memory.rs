use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use pps_types::{ClaimToken, DatasetId, DatasetRef, LedgerEntry};

use crate::error::{LedgerError, LedgerResult};
use crate::traits::{EntryQuery, TransferLedger};
use crate::validation::check_transition;

/// Entry map shared by the in-memory and journaled ledgers.
#[derive(Default)]
pub(crate) struct LedgerState {
    entries: BTreeMap<DatasetId, LedgerEntry>,
}

impl LedgerState {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let mut state = Self::default();
        for entry in entries {
            state.restore(entry);
        }
        state
    }

    /// Install a recovered entry; the highest version of an id wins.
    pub(crate) fn restore(&mut self, entry: LedgerEntry) {
        match self.entries.get(&entry.dataset_id) {
            Some(existing) if existing.version > entry.version => {}
            _ => {
                self.entries.insert(entry.dataset_id, entry);
            }
        }
    }

    pub(crate) fn get(&self, id: &DatasetId) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// The entry `register` would create, or `None` if the id is known.
    pub(crate) fn prepare_register(
        &self,
        reference: &DatasetRef,
        discovered_at: DateTime<Utc>,
        eligible_at: Option<DateTime<Utc>>,
    ) -> Option<LedgerEntry> {
        if self.entries.contains_key(&reference.id) {
            return None;
        }
        let mut entry = LedgerEntry::discovered(reference.clone(), discovered_at, eligible_at);
        entry.version = 1;
        Some(entry)
    }

    /// The entry a compare-and-swap would store, after version and
    /// transition checks.
    pub(crate) fn prepare_swap(
        &self,
        current: &LedgerEntry,
        mut next: LedgerEntry,
        holder: Option<&ClaimToken>,
    ) -> LedgerResult<LedgerEntry> {
        let id = current.dataset_id;
        let stored = self.entries.get(&id).ok_or(LedgerError::NotFound(id))?;
        if stored.version != current.version {
            return Err(LedgerError::VersionConflict {
                id,
                expected: current.version,
                actual: stored.version,
            });
        }
        check_transition(stored, &next, holder)?;
        next.version = stored.version + 1;
        Ok(next)
    }

    pub(crate) fn publish(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.dataset_id, entry);
    }

    pub(crate) fn scan(&self, query: &EntryQuery) -> Vec<LedgerEntry> {
        let lower = match query.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        let matching = self
            .entries
            .range((lower, Bound::Unbounded))
            .map(|(_, entry)| entry)
            .filter(|entry| query.matches(entry))
            .cloned();
        match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}

pub(crate) fn read_state(lock: &RwLock<LedgerState>) -> LedgerResult<RwLockReadGuard<'_, LedgerState>> {
    lock.read()
        .map_err(|_| LedgerError::Unavailable("ledger read lock poisoned".into()))
}

pub(crate) fn write_state(
    lock: &RwLock<LedgerState>,
) -> LedgerResult<RwLockWriteGuard<'_, LedgerState>> {
    lock.write()
        .map_err(|_| LedgerError::Unavailable("ledger write lock poisoned".into()))
}

/// In-memory ledger for tests, local demos, and embedding.
///
/// Nothing survives the process; use
/// [`JournaledLedger`](crate::JournaledLedger) for durability.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferLedger for InMemoryLedger {
    fn register(
        &self,
        reference: &DatasetRef,
        discovered_at: DateTime<Utc>,
        eligible_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let mut state = write_state(&self.inner)?;
        match state.prepare_register(reference, discovered_at, eligible_at) {
            Some(entry) => {
                state.publish(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get(&self, id: &DatasetId) -> LedgerResult<Option<LedgerEntry>> {
        Ok(read_state(&self.inner)?.get(id).cloned())
    }

    fn scan(&self, query: &EntryQuery) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(read_state(&self.inner)?.scan(query))
    }

    fn compare_and_swap(
        &self,
        current: &LedgerEntry,
        next: LedgerEntry,
        holder: Option<&ClaimToken>,
    ) -> LedgerResult<LedgerEntry> {
        let mut state = write_state(&self.inner)?;
        let next = state.prepare_swap(current, next, holder)?;
        state.publish(next.clone());
        Ok(next)
    }

    fn len(&self) -> LedgerResult<usize> {
        Ok(read_state(&self.inner)?.len())
    }
}
