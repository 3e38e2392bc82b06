use chrono::{DateTime, Utc};
use pps_ledger::EntryQuery;
use pps_repo::DeleteOutcome;
use pps_types::{Claim, ClaimToken, DatasetId, DatasetState, LedgerEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};

const OWNER: &str = "retention";

/// What a purge request did, or why it did nothing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PurgeDecision {
    /// Deleted from the source and recorded as `Purged`.
    Purged,
    AlreadyPurged,
    /// Replicated, but the retention window has not elapsed.
    Deferred { until: DateTime<Utc> },
    /// Replicated under a retain-forever rule.
    RetainForever,
    /// Not yet replicated; the source copy is the only one.
    NotReplicated { state: DatasetState },
    /// Another component holds the entry's claim.
    Busy,
    /// The destination could not confirm a matching copy.
    Unverified { reason: String },
    DeleteFailed { reason: String },
}

/// Outcome of one retention pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Entries past their retention deadline.
    pub due: usize,
    pub purged: usize,
    pub busy: usize,
    pub unverified: usize,
    pub delete_failed: usize,
}

impl RetentionReport {
    fn record(&mut self, decision: &PurgeDecision) {
        match decision {
            PurgeDecision::Purged => self.purged += 1,
            PurgeDecision::Busy => self.busy += 1,
            PurgeDecision::Unverified { .. } => self.unverified += 1,
            PurgeDecision::DeleteFailed { .. } => self.delete_failed += 1,
            _ => {}
        }
    }
}

/// Deletes replicated datasets from the source once their retention window
/// has elapsed.
///
/// A purge holds the entry's claim while it re-verifies the destination copy
/// and deletes the source copy, so it never races a reconciler demotion.
pub struct RetentionManager {
    ctx: EngineContext,
}

impl RetentionManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run_once(&self) -> EngineResult<RetentionReport> {
        let mut report = RetentionReport::default();
        let page = self.ctx.config.scan_batch_size;
        let mut after: Option<DatasetId> = None;

        loop {
            let now = self.ctx.clock.now();
            let mut query = EntryQuery::purge_due(now).limit(page);
            if let Some(id) = after {
                query = query.after(id);
            }
            let entries = self.ctx.ledger.scan(&query)?;
            let exhausted = entries.len() < page;
            for entry in entries {
                after = Some(entry.dataset_id);
                report.due += 1;
                let decision = self.purge_entry(entry).await?;
                report.record(&decision);
            }
            if exhausted {
                break;
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                purged = report.purged,
                busy = report.busy,
                unverified = report.unverified,
                delete_failed = report.delete_failed,
                "retention pass complete"
            );
        }
        Ok(report)
    }

    /// Purge one dataset now if its lifecycle allows it.
    pub async fn purge(&self, id: &DatasetId) -> EngineResult<PurgeDecision> {
        let entry = self
            .ctx
            .ledger
            .get(id)?
            .ok_or(EngineError::NotFound(*id))?;
        self.purge_entry(entry).await
    }

    async fn purge_entry(&self, entry: LedgerEntry) -> EngineResult<PurgeDecision> {
        let now = self.ctx.clock.now();
        match entry.state {
            DatasetState::Purged => return Ok(PurgeDecision::AlreadyPurged),
            DatasetState::Replicated => {}
            state => return Ok(PurgeDecision::NotReplicated { state }),
        }
        let Some(deadline) = entry.retention_deadline else {
            return Ok(PurgeDecision::RetainForever);
        };
        if deadline > now {
            return Ok(PurgeDecision::Deferred { until: deadline });
        }
        if entry.is_claimed_at(now) {
            return Ok(PurgeDecision::Busy);
        }

        let claim = Claim::new(OWNER, now, self.ctx.config.claim_ttl());
        let token = claim.token;
        let claimed = match self
            .ctx
            .ledger
            .compare_and_swap(&entry, entry.with_claim(claim), None)
        {
            Ok(claimed) => claimed,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                debug!(dataset = %entry.dataset_id, error = %e, "purge claim lost race");
                return Ok(PurgeDecision::Busy);
            }
        };

        let decision = self.verify_and_delete(&claimed).await;
        match decision {
            Ok(()) => self.record_purge(&claimed.dataset_id, &token),
            Err(decision) => {
                self.release(&claimed.dataset_id, &token)?;
                Ok(decision)
            }
        }
    }

    /// Confirm the destination copy, then delete the source copy. A source
    /// that no longer has the dataset counts as deleted.
    async fn verify_and_delete(&self, entry: &LedgerEntry) -> Result<(), PurgeDecision> {
        let id = entry.dataset_id;
        let ctx = &self.ctx;

        let unverified = |reason: String| {
            warn!(dataset = %id, %reason, "purge skipped; destination copy unverified");
            PurgeDecision::Unverified { reason }
        };
        match ctx.bounded("fingerprint", ctx.destination.fingerprint(&id)).await {
            Ok(stored) if stored == entry.reference.fingerprint => {}
            Ok(stored) => {
                return Err(unverified(format!(
                    "destination holds {}, expected {}",
                    stored.short_hex(),
                    entry.reference.fingerprint.short_hex()
                )))
            }
            Err(e) => return Err(unverified(e.to_string())),
        }

        match ctx.bounded("delete", ctx.source.delete(&id)).await {
            Ok(DeleteOutcome::Deleted) => Ok(()),
            Ok(DeleteOutcome::AlreadyAbsent) => {
                debug!(dataset = %id, "already absent at source");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(dataset = %id, error = %e, "source delete failed; will retry next pass");
                Err(PurgeDecision::DeleteFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn record_purge(&self, id: &DatasetId, token: &ClaimToken) -> EngineResult<PurgeDecision> {
        let Some(current) = self.held_entry(id, token)? else {
            warn!(dataset = %id, "purge claim lost after source delete");
            return Ok(PurgeDecision::Busy);
        };
        let now = self.ctx.clock.now();
        match self
            .ctx
            .ledger
            .compare_and_swap(&current, current.purged(now), Some(token))
        {
            Ok(_) => {
                info!(dataset = %id, dataset_type = %current.reference.dataset_type, "purged from source");
                Ok(PurgeDecision::Purged)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(dataset = %id, error = %e, "purge not recorded");
                Ok(PurgeDecision::Busy)
            }
        }
    }

    fn release(&self, id: &DatasetId, token: &ClaimToken) -> EngineResult<()> {
        let Some(current) = self.held_entry(id, token)? else {
            return Ok(());
        };
        match self
            .ctx
            .ledger
            .compare_and_swap(&current, current.without_claim(), Some(token))
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!(dataset = %id, error = %e, "purge claim release skipped");
                Ok(())
            }
        }
    }

    fn held_entry(&self, id: &DatasetId, token: &ClaimToken) -> EngineResult<Option<LedgerEntry>> {
        let current = self
            .ctx
            .ledger
            .get(id)?
            .ok_or(EngineError::NotFound(*id))?;
        let ours = current.claim.as_ref().is_some_and(|c| c.token == *token);
        Ok(ours.then_some(current))
    }
}
