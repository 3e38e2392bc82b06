use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use pps_types::{ClaimToken, DatasetId, DatasetRef, LedgerEntry};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::LedgerResult;
use crate::journal::{Journal, SyncMode};
use crate::memory::{read_state, write_state, LedgerState};
use crate::traits::{EntryQuery, TransferLedger};

/// Outcome of [`JournaledLedger::compact`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub entries: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Durable ledger: the entry map lives in memory and every accepted write is
/// appended to a [`Journal`] before it becomes visible.
///
/// Opening replays the journal. Writes hold the map's write lock across the
/// journal append, so the journal order matches the order readers observe.
/// Only one `JournaledLedger` may have a given journal open at a time.
pub struct JournaledLedger {
    journal: Journal,
    inner: RwLock<LedgerState>,
}

impl JournaledLedger {
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> LedgerResult<Self> {
        let path = path.as_ref();
        let journal = Journal::open(path, sync_mode)?;
        let recovery = journal.recover()?;
        if recovery.skipped > 0 || recovery.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                skipped = recovery.skipped,
                torn_bytes = recovery.torn_bytes,
                "ledger journal had damaged records"
            );
        }
        let records = recovery.entries.len();
        let state = LedgerState::from_entries(recovery.entries);
        info!(path = %path.display(), records, entries = state.len(), "ledger opened");

        let ledger = Self {
            journal,
            inner: RwLock::new(state),
        };
        if recovery.torn_bytes > 0 {
            // Appending after a torn record would hide every later write from replay.
            ledger.compact()?;
        }
        Ok(ledger)
    }

    /// Rewrite the journal to one record per entry.
    pub fn compact(&self) -> LedgerResult<CompactionReport> {
        let state = write_state(&self.inner)?;
        let bytes_before = self.journal.offset()?;
        let bytes_after = self.journal.rewrite(state.entries())?;
        let report = CompactionReport {
            entries: state.len(),
            bytes_before,
            bytes_after,
        };
        info!(
            entries = report.entries,
            bytes_before, bytes_after, "ledger journal compacted"
        );
        Ok(report)
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }
}

impl TransferLedger for JournaledLedger {
    fn register(
        &self,
        reference: &DatasetRef,
        discovered_at: DateTime<Utc>,
        eligible_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let mut state = write_state(&self.inner)?;
        match state.prepare_register(reference, discovered_at, eligible_at) {
            Some(entry) => {
                self.journal.append(&entry)?;
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
        self.journal.append(&next)?;
        state.publish(next.clone());
        Ok(next)
    }

    fn len(&self) -> LedgerResult<usize> {
        Ok(read_state(&self.inner)?.len())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use chrono::Duration;
    use pps_types::{Claim, DatasetState, Fingerprint};

    use super::*;
    use crate::error::LedgerError;

    fn reference(seed: u8) -> DatasetRef {
        DatasetRef::new(
            DatasetId::ephemeral(),
            Fingerprint::from_hash([seed; 32]),
            "preliminary_visit_image",
        )
    }

    fn replicate(ledger: &JournaledLedger, id: &DatasetId, now: DateTime<Utc>) -> LedgerEntry {
        let current = ledger.get(id).unwrap().unwrap();
        let claim = Claim::new("w", now, Duration::seconds(30));
        let token = claim.token;
        let claimed = ledger
            .compare_and_swap(&current, current.with_claim(claim).begin_attempt(now), None)
            .unwrap();
        ledger
            .compare_and_swap(
                &claimed,
                claimed.replicated(now, Some(Duration::hours(24))),
                Some(&token),
            )
            .unwrap()
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let now = Utc::now();
        let (a, b) = (reference(1), reference(2));
        let replicated = {
            let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
            ledger.register(&a, now, None).unwrap();
            ledger.register(&b, now, None).unwrap();
            replicate(&ledger, &a.id, now)
        };

        let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
        assert_eq!(ledger.len().unwrap(), 2);
        assert_eq!(ledger.get(&a.id).unwrap().unwrap(), replicated);
        assert_eq!(ledger.get(&b.id).unwrap().unwrap().state, DatasetState::Pending);
        // Re-registering after restart stays a no-op.
        assert!(!ledger.register(&a, now, None).unwrap());
    }

    #[test]
    fn concurrent_opener_cannot_compact_under_a_live_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let now = Utc::now();
        let a = reference(1);
        let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
        ledger.register(&a, now, None).unwrap();

        let err = JournaledLedger::open(&path, SyncMode::EveryWrite).err().unwrap();
        assert!(matches!(err, LedgerError::Locked(_)));
        assert!(err.is_fatal());

        replicate(&ledger, &a.id, now);
        drop(ledger);
        let reopened = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
        assert_eq!(reopened.get(&a.id).unwrap().unwrap().state, DatasetState::Replicated);
    }

    #[test]
    fn compact_keeps_latest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let now = Utc::now();
        let a = reference(1);
        let ledger = JournaledLedger::open(&path, SyncMode::OsDefault).unwrap();
        ledger.register(&a, now, None).unwrap();
        let latest = replicate(&ledger, &a.id, now);

        let report = ledger.compact().unwrap();
        assert_eq!(report.entries, 1);
        assert!(report.bytes_after < report.bytes_before);
        drop(ledger);

        let reopened = JournaledLedger::open(&path, SyncMode::OsDefault).unwrap();
        assert_eq!(reopened.get(&a.id).unwrap().unwrap(), latest);
    }

    #[test]
    fn torn_tail_is_tolerated_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let now = Utc::now();
        let (a, b, c) = (reference(1), reference(2), reference(3));
        {
            let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
            ledger.register(&a, now, None).unwrap();
            ledger.register(&b, now, None).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();

        {
            let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
            assert_eq!(ledger.len().unwrap(), 1);
            assert!(ledger.get(&a.id).unwrap().is_some());
            // The lost registration is simply rediscovered, and later writes
            // remain visible after another restart.
            assert!(ledger.register(&b, now, None).unwrap());
            assert!(ledger.register(&c, now, None).unwrap());
        }
        let ledger = JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap();
        assert_eq!(ledger.len().unwrap(), 3);
    }
}
