use std::sync::Mutex;

use pps_ledger::EntryQuery;
use pps_types::{DatasetId, DatasetState, LedgerEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};

/// Outcome of one reconcile pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Lapsed claims cleared.
    pub claims_released: usize,
    /// Live claims held past the stuck threshold and force-released.
    pub stuck_released: usize,
    /// `Retrying` entries whose backoff has elapsed.
    pub reenqueued: usize,
    /// Replicated entries re-checked at the destination.
    pub audited: usize,
    /// Replicated entries sent back for re-replication.
    pub demoted: usize,
    /// The audit stopped early because the destination was unreachable.
    pub audit_skipped: bool,
}

/// Repairs drift between the ledger and the repositories.
///
/// Each pass releases lapsed and stuck claims, then audits a rolling batch
/// of replicated entries against the destination and demotes any whose
/// copy is missing or no longer matches.
pub struct Reconciler {
    ctx: EngineContext,
    /// Last entry audited; the next pass continues after it.
    cursor: Mutex<Option<DatasetId>>,
}

impl Reconciler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            cursor: Mutex::new(None),
        }
    }

    pub async fn run_once(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.release_claims(&mut report)?;
        report.reenqueued = self.due_retries()?;
        self.audit(&mut report).await?;
        if report != ReconcileReport::default() {
            info!(
                claims_released = report.claims_released,
                stuck_released = report.stuck_released,
                audited = report.audited,
                demoted = report.demoted,
                "reconcile pass complete"
            );
        }
        Ok(report)
    }

    fn release_claims(&self, report: &mut ReconcileReport) -> EngineResult<()> {
        let now = self.ctx.clock.now();
        let threshold = self.ctx.config.stuck_threshold();

        for entry in self.ctx.ledger.scan(&EntryQuery::expired_claims(now))? {
            if self.clear_claim(&entry)? {
                report.claims_released += 1;
                debug!(dataset = %entry.dataset_id, "released lapsed claim");
            }
        }

        for entry in self.ctx.ledger.scan(&EntryQuery::stuck_claims(now, now - threshold))? {
            let Some(claim) = &entry.claim else { continue };
            if self.clear_claim(&entry)? {
                report.stuck_released += 1;
                warn!(
                    dataset = %entry.dataset_id,
                    owner = %claim.owner,
                    held_secs = claim.held_for(now).num_seconds(),
                    "force-released stuck claim"
                );
            }
        }
        Ok(())
    }

    /// Clear a claim without the holder's token. Only claim-only changes are
    /// made this way. Returns `false` if the entry moved on in the meantime.
    fn clear_claim(&self, entry: &LedgerEntry) -> EngineResult<bool> {
        match self
            .ctx
            .ledger
            .compare_and_swap(entry, entry.without_claim(), None)
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn due_retries(&self) -> EngineResult<usize> {
        let now = self.ctx.clock.now();
        let due = self
            .ctx
            .ledger
            .scan(&EntryQuery::claimable(now))?
            .into_iter()
            .filter(|e| e.state == DatasetState::Retrying)
            .count();
        Ok(due)
    }

    async fn audit(&self, report: &mut ReconcileReport) -> EngineResult<()> {
        let batch = self.ctx.config.audit_batch_size;
        let cursor = *self.cursor.lock().map_err(|_| poisoned())?;
        let query = |after: Option<DatasetId>| {
            let q = EntryQuery::in_states([DatasetState::Replicated]).limit(batch);
            match after {
                Some(id) => q.after(id),
                None => q,
            }
        };

        let mut entries = self.ctx.ledger.scan(&query(cursor))?;
        if entries.len() < batch && cursor.is_some() {
            // Wrap around to the start of the ledger.
            let seen: Vec<DatasetId> = entries.iter().map(|e| e.dataset_id).collect();
            let rest = self
                .ctx
                .ledger
                .scan(&query(None).limit(batch - entries.len()))?;
            entries.extend(rest.into_iter().filter(|e| !seen.contains(&e.dataset_id)));
        }

        let mut last = cursor;
        for entry in entries {
            let now = self.ctx.clock.now();
            if entry.is_claimed_at(now) {
                last = Some(entry.dataset_id);
                continue;
            }
            let id = entry.dataset_id;
            let destination = &self.ctx.destination;
            let problem = match self.ctx.bounded("fingerprint", destination.fingerprint(&id)).await {
                Ok(stored) if stored == entry.reference.fingerprint => None,
                Ok(stored) => Some(format!(
                    "destination copy changed: holds {}, expected {}",
                    stored.short_hex(),
                    entry.reference.fingerprint.short_hex()
                )),
                Err(e) if e.is_not_found() => Some("destination copy missing".to_string()),
                Err(e) => {
                    warn!(dataset = %id, error = %e, "audit interrupted; destination unreachable");
                    report.audit_skipped = true;
                    break;
                }
            };
            report.audited += 1;
            last = Some(id);

            if let Some(reason) = problem {
                if self.demote(&entry, &reason)? {
                    report.demoted += 1;
                }
            }
        }

        *self.cursor.lock().map_err(|_| poisoned())? = last;
        Ok(())
    }

    fn demote(&self, entry: &LedgerEntry, reason: &str) -> EngineResult<bool> {
        let now = self.ctx.clock.now();
        match self
            .ctx
            .ledger
            .compare_and_swap(entry, entry.demoted(now, reason), None)
        {
            Ok(stored) => {
                warn!(
                    dataset = %entry.dataset_id,
                    demotions = stored.demotions,
                    reason,
                    "replicated dataset demoted for re-replication"
                );
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!(dataset = %entry.dataset_id, error = %e, "demotion skipped");
                Ok(false)
            }
        }
    }
}

fn poisoned() -> EngineError {
    EngineError::Task("reconciler cursor lock poisoned".into())
}
