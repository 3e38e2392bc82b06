use pps_ledger::{EntryQuery, LedgerStats, LedgerValidator, ProjectionBuilder, ValidationReport};
use pps_types::{DatasetId, DatasetState, LedgerEntry};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};

/// A ledger entry together with its state as observed now.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub effective_state: DatasetState,
    #[serde(flatten)]
    pub entry: LedgerEntry,
}

/// Manual actions and queries against the ledger.
pub struct Operator {
    ctx: EngineContext,
}

impl Operator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Send a `Failed` entry back to `Pending` with a fresh attempt budget.
    pub fn requeue(&self, id: &DatasetId) -> EngineResult<LedgerEntry> {
        let current = self.entry(id)?;
        if current.state != DatasetState::Failed {
            return Err(EngineError::InvalidOperation {
                id: *id,
                action: "requeue",
                state: current.state,
            });
        }
        let now = self.ctx.clock.now();
        let stored = self
            .ctx
            .ledger
            .compare_and_swap(&current, current.requeued(now), None)?;
        info!(
            dataset = %id,
            attempt_count = stored.attempt_count,
            "requeued by operator"
        );
        Ok(stored)
    }

    pub fn show(&self, id: &DatasetId) -> EngineResult<EntryView> {
        let entry = self.entry(id)?;
        Ok(EntryView {
            effective_state: entry.effective_state(self.ctx.clock.now()),
            entry,
        })
    }

    /// Entries whose effective state is `state`, in id order.
    pub fn list(&self, state: DatasetState, limit: Option<usize>) -> EngineResult<Vec<EntryView>> {
        let now = self.ctx.clock.now();
        let query = match state {
            DatasetState::Purgeable => EntryQuery::purge_due(now),
            stored => EntryQuery::in_states([stored]),
        };
        let views = self
            .ctx
            .ledger
            .scan(&query)?
            .into_iter()
            .map(|entry| EntryView {
                effective_state: entry.effective_state(now),
                entry,
            })
            .filter(|view| view.effective_state == state)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(views)
    }

    pub fn stats(&self) -> EngineResult<LedgerStats> {
        Ok(ProjectionBuilder::stats(
            self.ctx.ledger.as_ref(),
            self.ctx.clock.now(),
        )?)
    }

    /// Check every stored entry against the lifecycle rules.
    pub fn validate(&self) -> EngineResult<ValidationReport> {
        Ok(LedgerValidator::validate(self.ctx.ledger.as_ref())?)
    }

    fn entry(&self, id: &DatasetId) -> EngineResult<LedgerEntry> {
        self.ctx
            .ledger
            .get(id)?
            .ok_or(EngineError::NotFound(*id))
    }
}
