use std::time::Duration;

use chrono::{DateTime, Utc};
use pps_ledger::EntryQuery;
use pps_repo::ImportOutcome;
use pps_types::{Claim, ClaimToken, DatasetId, DatasetRef, LedgerEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult, Stage, TransferFailure};

/// What happened to one claimed entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    Replicated {
        id: DatasetId,
        attempt: u32,
    },
    Retrying {
        id: DatasetId,
        attempt: u32,
        failure: TransferFailure,
        retry_at: DateTime<Utc>,
    },
    Failed {
        id: DatasetId,
        attempt: u32,
        failure: TransferFailure,
    },
    /// The claim was released by someone else; the result was discarded.
    ClaimLost { id: DatasetId },
    /// Shutdown interrupted the transfer; the claim was released.
    Cancelled { id: DatasetId },
}

/// Tally of a [`WorkerPool::drain`] run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub replicated: usize,
    pub retrying: usize,
    pub failed: usize,
    pub claim_lost: usize,
    pub cancelled: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Replicated { .. } => self.replicated += 1,
            WorkOutcome::Retrying { .. } => self.retrying += 1,
            WorkOutcome::Failed { .. } => self.failed += 1,
            WorkOutcome::ClaimLost { .. } => self.claim_lost += 1,
            WorkOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }

    fn merge(&mut self, other: &DrainReport) {
        self.replicated += other.replicated;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.claim_lost += other.claim_lost;
        self.cancelled += other.cancelled;
    }

    pub fn total(&self) -> usize {
        self.replicated + self.retrying + self.failed + self.claim_lost + self.cancelled
    }
}

/// Claims due ledger entries and runs export, import and verify for each.
pub struct TransferWorker {
    ctx: EngineContext,
    name: String,
}

impl TransferWorker {
    pub fn new(ctx: EngineContext, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Work until shutdown, sleeping briefly whenever nothing is claimable.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        debug!(worker = %self.name, "transfer worker started");
        while !*shutdown.borrow() {
            if self.step(&mut shutdown).await?.is_some() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.worker_poll()) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(worker = %self.name, "transfer worker stopped");
        Ok(())
    }

    /// Work until nothing is claimable.
    pub async fn run_until_idle(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<DrainReport> {
        let mut report = DrainReport::default();
        while !*shutdown.borrow() {
            match self.step(&mut shutdown).await? {
                Some(outcome) => report.record(&outcome),
                None => break,
            }
        }
        Ok(report)
    }

    /// Claim and process one entry. `None` if nothing was claimable.
    pub async fn step(&self, shutdown: &mut watch::Receiver<bool>) -> EngineResult<Option<WorkOutcome>> {
        match self.claim_next()? {
            Some((entry, token)) => Ok(Some(self.process(entry, token, shutdown).await?)),
            None => Ok(None),
        }
    }

    /// Claim the first claimable entry, recording the start of an attempt
    /// in the same write.
    pub fn claim_next(&self) -> EngineResult<Option<(LedgerEntry, ClaimToken)>> {
        let now = self.ctx.clock.now();
        let query = EntryQuery::claimable(now).limit(self.ctx.config.scan_batch_size);
        for current in self.ctx.ledger.scan(&query)? {
            let claim = Claim::new(self.name.clone(), now, self.ctx.config.claim_ttl());
            let token = claim.token;
            let next = current.with_claim(claim).begin_attempt(now);
            match self.ctx.ledger.compare_and_swap(&current, next, None) {
                Ok(stored) => {
                    debug!(
                        worker = %self.name,
                        dataset = %stored.dataset_id,
                        attempt = stored.attempt_count,
                        "claimed"
                    );
                    return Ok(Some((stored, token)));
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    debug!(worker = %self.name, dataset = %current.dataset_id, error = %e, "claim lost race");
                }
            }
        }
        Ok(None)
    }

    /// Transfer a claimed entry, renewing the claim while the transfer runs.
    pub async fn process(
        &self,
        entry: LedgerEntry,
        token: ClaimToken,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EngineResult<WorkOutcome> {
        let id = entry.dataset_id;
        let transfer = self.transfer(&entry.reference);
        tokio::pin!(transfer);

        let period = self.ctx.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = loop {
            tokio::select! {
                result = &mut transfer => break Some(result),
                _ = heartbeat.tick() => {
                    if !self.renew(&id, &token)? {
                        warn!(worker = %self.name, dataset = %id, "claim lost during transfer");
                        return Ok(WorkOutcome::ClaimLost { id });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                }
            }
        };

        match result {
            Some(result) => self.finish(&id, &token, result),
            None => {
                info!(worker = %self.name, dataset = %id, "transfer cancelled by shutdown");
                self.release(&id, &token)?;
                Ok(WorkOutcome::Cancelled { id })
            }
        }
    }

    /// Export, import and verify one dataset.
    async fn transfer(&self, reference: &DatasetRef) -> Result<(), TransferFailure> {
        let id = reference.id;
        let ctx = &self.ctx;

        let unit = ctx
            .bounded("export", ctx.source.export(&id))
            .await
            .map_err(|e| TransferFailure::from_repo(Stage::Export, &e))?;
        if unit.reference.fingerprint != reference.fingerprint {
            return Err(TransferFailure::Integrity {
                stage: Stage::Export,
                reason: format!(
                    "source now declares {}, discovered as {}",
                    unit.reference.fingerprint, reference.fingerprint
                ),
            });
        }
        let intact = unit
            .is_intact()
            .map_err(|e| TransferFailure::from_repo(Stage::Export, &e))?;
        if !intact {
            return Err(TransferFailure::Integrity {
                stage: Stage::Export,
                reason: "exported content does not match its fingerprint".into(),
            });
        }

        let outcome = ctx
            .bounded("import", ctx.destination.import(&unit))
            .await
            .map_err(|e| TransferFailure::from_repo(Stage::Import, &e))?;
        if outcome == ImportOutcome::AlreadyPresent {
            debug!(dataset = %id, "already present at destination");
        }

        let stored = ctx
            .bounded("fingerprint", ctx.destination.fingerprint(&id))
            .await
            .map_err(|e| TransferFailure::from_repo(Stage::Verify, &e))?;
        if stored != reference.fingerprint {
            return Err(TransferFailure::Integrity {
                stage: Stage::Verify,
                reason: format!(
                    "destination holds {}, expected {}",
                    stored.short_hex(),
                    reference.fingerprint.short_hex()
                ),
            });
        }
        Ok(())
    }

    /// Record the transfer result. The entry is re-read so that a claim
    /// released in the meantime is noticed.
    fn finish(
        &self,
        id: &DatasetId,
        token: &ClaimToken,
        result: Result<(), TransferFailure>,
    ) -> EngineResult<WorkOutcome> {
        let Some(current) = self.held_entry(id, token)? else {
            warn!(worker = %self.name, dataset = %id, "claim lost before recording result");
            return Ok(WorkOutcome::ClaimLost { id: *id });
        };
        let now = self.ctx.clock.now();
        let attempt = current.attempt_count;
        let config = &self.ctx.config;

        let (next, outcome) = match result {
            Ok(()) => {
                let window = config.retention.window_for(&current.reference.dataset_type);
                (
                    current.replicated(now, window),
                    WorkOutcome::Replicated { id: *id, attempt },
                )
            }
            Err(failure) if current.attempts_since_requeue() >= config.attempt_ceiling => (
                current.attempt_failed(failure.to_string(), None),
                WorkOutcome::Failed {
                    id: *id,
                    attempt,
                    failure,
                },
            ),
            Err(failure) => {
                let delay = config.backoff.delay_for(current.attempts_since_requeue());
                let retry_at = now + to_chrono(delay);
                (
                    current.attempt_failed(failure.to_string(), Some(retry_at)),
                    WorkOutcome::Retrying {
                        id: *id,
                        attempt,
                        failure,
                        retry_at,
                    },
                )
            }
        };

        match self.ctx.ledger.compare_and_swap(&current, next, Some(token)) {
            Ok(stored) => {
                log_outcome(&self.name, &outcome, &stored);
                Ok(outcome)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(worker = %self.name, dataset = %id, error = %e, "result discarded");
                Ok(WorkOutcome::ClaimLost { id: *id })
            }
        }
    }

    /// Extend the claim. Returns `false` if it is no longer ours.
    fn renew(&self, id: &DatasetId, token: &ClaimToken) -> EngineResult<bool> {
        let Some(current) = self.held_entry(id, token)? else {
            return Ok(false);
        };
        let next = current.with_renewed_claim(self.ctx.clock.now(), self.ctx.config.claim_ttl());
        match self.ctx.ledger.compare_and_swap(&current, next, Some(token)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_fatal() => Err(e.into()),
            // Changed under us; the next heartbeat re-reads and decides.
            Err(e) if e.is_conflict() => Ok(true),
            Err(e) => {
                debug!(worker = %self.name, dataset = %id, error = %e, "claim renewal refused");
                Ok(false)
            }
        }
    }

    fn release(&self, id: &DatasetId, token: &ClaimToken) -> EngineResult<()> {
        if let Some(current) = self.held_entry(id, token)? {
            match self
                .ctx
                .ledger
                .compare_and_swap(&current, current.without_claim(), Some(token))
            {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(dataset = %id, error = %e, "claim release skipped"),
            }
        }
        Ok(())
    }

    /// The stored entry, if it still carries our claim.
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

fn log_outcome(worker: &str, outcome: &WorkOutcome, stored: &LedgerEntry) {
    match outcome {
        WorkOutcome::Replicated { id, attempt } => info!(
            worker,
            dataset = %id,
            attempt,
            retention_deadline = ?stored.retention_deadline,
            "replicated"
        ),
        WorkOutcome::Retrying {
            id,
            attempt,
            failure,
            retry_at,
        } => warn!(
            worker,
            dataset = %id,
            attempt,
            kind = failure.kind(),
            error = %failure,
            %retry_at,
            "transfer failed; will retry"
        ),
        WorkOutcome::Failed {
            id,
            attempt,
            failure,
        } => warn!(
            worker,
            dataset = %id,
            attempt,
            kind = failure.kind(),
            error = %failure,
            "transfer failed permanently"
        ),
        WorkOutcome::ClaimLost { .. } | WorkOutcome::Cancelled { .. } => {}
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// A fixed-size pool of [`TransferWorker`]s.
pub struct WorkerPool {
    ctx: EngineContext,
}

impl WorkerPool {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn workers(&self) -> Vec<TransferWorker> {
        (0..self.ctx.config.worker_count)
            .map(|i| TransferWorker::new(self.ctx.clone(), format!("worker-{i}")))
            .collect()
    }

    /// Run every worker until shutdown. A fatal error in any worker stops
    /// the others and is returned.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        let mut tasks = JoinSet::new();
        for worker in self.workers() {
            let rx = shutdown.clone();
            tasks.spawn(async move { worker.run(rx).await });
        }
        join_all(tasks, |_: ()| {}).await
    }

    /// Run every worker until nothing is claimable.
    pub async fn drain(&self, shutdown: watch::Receiver<bool>) -> EngineResult<DrainReport> {
        let mut tasks = JoinSet::new();
        for worker in self.workers() {
            let rx = shutdown.clone();
            tasks.spawn(async move { worker.run_until_idle(rx).await });
        }
        let mut total = DrainReport::default();
        join_all(tasks, |report: DrainReport| total.merge(&report)).await?;
        Ok(total)
    }
}

async fn join_all<T: 'static>(
    mut tasks: JoinSet<EngineResult<T>>,
    mut collect: impl FnMut(T),
) -> EngineResult<()> {
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| EngineError::Task(e.to_string()))?;
        match result {
            Ok(value) => collect(value),
            Err(e) => {
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use pps_ledger::TransferLedger;
    use pps_repo::{Fault, Operation, RepositoryAdapter};
    use pps_types::DatasetState;

    use super::*;
    use crate::discovery::DiscoveryWatcher;
    use crate::testkit::{harness, t0, test_config, Harness};

    async fn discovered(h: &Harness) {
        DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();
    }

    #[tokio::test]
    async fn successful_transfer_replicates() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::Replicated {
                id: unit.reference.id,
                attempt: 1
            }
        );

        let entry = h.entry(unit.id());
        assert_eq!(entry.state, DatasetState::Replicated);
        assert_eq!(entry.completed_at, Some(t0()));
        assert_eq!(entry.retention_deadline, Some(t0() + ChronoDuration::hours(24)));
        assert!(entry.claim.is_none());
        assert!(h.destination.contains(unit.id()));
    }

    #[tokio::test]
    async fn transient_failure_backs_off() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        h.destination.fail_next(Operation::Import, Fault::Unavailable);

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Retrying {
                failure: TransferFailure::Transient { .. },
                ..
            }
        ));
        let entry = h.entry(unit.id());
        assert_eq!(entry.state, DatasetState::Retrying);
        assert_eq!(entry.next_attempt_at, Some(t0() + ChronoDuration::seconds(10)));
        assert!(entry.last_error.is_some());

        // Not due yet.
        assert!(worker.step(&mut rx).await.unwrap().is_none());
        h.clock.advance(ChronoDuration::seconds(10));
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Replicated { attempt: 2, .. }));
    }

    #[tokio::test]
    async fn corrupted_import_is_never_replicated() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        h.destination.corrupt_on_import(unit.reference.id, 1);

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Retrying {
                failure: TransferFailure::Integrity { stage: Stage::Verify, .. },
                ..
            }
        ));
        assert_eq!(h.entry(unit.id()).state, DatasetState::Retrying);

        // The retry re-imports over the damaged copy.
        h.clock.advance(ChronoDuration::hours(1));
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Replicated { .. }));
    }

    #[tokio::test]
    async fn integrity_failure_on_last_attempt_fails_the_entry() {
        let mut config = test_config();
        config.attempt_ceiling = 3;
        let h = harness(config);
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        h.destination.corrupt_on_import(unit.reference.id, 3);

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        for _ in 0..2 {
            let outcome = worker.step(&mut rx).await.unwrap().unwrap();
            assert!(matches!(outcome, WorkOutcome::Retrying { .. }));
            h.clock.advance(ChronoDuration::hours(1));
        }
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Failed {
                attempt: 3,
                failure: TransferFailure::Integrity { .. },
                ..
            }
        ));

        let entry = h.entry(unit.id());
        assert_eq!(entry.state, DatasetState::Failed);
        assert_eq!(entry.attempt_count, 3);
        assert!(entry.completed_at.is_none());
        assert!(entry.claim.is_none());
        let stored = h.destination.fingerprint(unit.id()).await.unwrap();
        assert_ne!(stored, unit.reference.fingerprint);
        assert!(h.source.contains(unit.id()));

        h.clock.advance(ChronoDuration::hours(1));
        assert!(worker.step(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn source_drift_is_an_integrity_failure() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        // The source replaces the dataset under the same id.
        let replaced = pps_repo::TransferUnit::new(
            unit.reference.id,
            "calexp",
            &b"different"[..],
            unit.metadata.clone(),
        )
        .unwrap();
        h.source.insert(replaced).unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Retrying {
                failure: TransferFailure::Integrity { stage: Stage::Export, .. },
                ..
            }
        ));
        assert!(!h.destination.contains(unit.id()));
    }

    #[tokio::test]
    async fn stalled_adapter_times_out() {
        let mut config = test_config();
        config.adapter_timeout_secs = 1;
        let h = harness(config);
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        h.source
            .fail_next(Operation::Export, Fault::Stall(std::time::Duration::from_secs(30)));

        let (_tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let outcome = worker.step(&mut rx).await.unwrap().unwrap();
        match outcome {
            WorkOutcome::Retrying { failure, .. } => {
                assert_eq!(failure.kind(), "transient");
                assert!(failure.to_string().contains("timed out"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.entry(unit.id()).attempt_count, 1);
    }

    #[tokio::test]
    async fn claimed_entry_is_not_claimed_twice() {
        let h = harness(test_config());
        h.produce("calexp", b"pixels");
        discovered(&h).await;

        let a = TransferWorker::new(h.ctx.clone(), "a");
        let b = TransferWorker::new(h.ctx.clone(), "b");
        assert!(a.claim_next().unwrap().is_some());
        assert!(b.claim_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_and_releases_claim() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;
        h.source
            .fail_next(Operation::Export, Fault::Stall(std::time::Duration::from_secs(3)));

        let (tx, mut rx) = watch::channel(false);
        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let (entry, token) = worker.claim_next().unwrap().unwrap();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });
        let outcome = worker.process(entry, token, &mut rx).await.unwrap();
        stop.await.unwrap();

        assert_eq!(outcome, WorkOutcome::Cancelled { id: unit.reference.id });
        let entry = h.entry(unit.id());
        assert!(entry.claim.is_none());
        assert_eq!(entry.state, DatasetState::Pending);
        assert_eq!(entry.attempt_count, 1);
    }

    #[tokio::test]
    async fn result_is_discarded_when_claim_was_taken_away() {
        let h = harness(test_config());
        let unit = h.produce("calexp", b"pixels");
        discovered(&h).await;

        let worker = TransferWorker::new(h.ctx.clone(), "w");
        let (_entry, token) = worker.claim_next().unwrap().unwrap();
        let current = h.entry(unit.id());
        h.ledger
            .compare_and_swap(&current, current.without_claim(), None)
            .unwrap();

        let outcome = worker.finish(&unit.reference.id, &token, Ok(())).unwrap();
        assert_eq!(outcome, WorkOutcome::ClaimLost { id: unit.reference.id });
        assert_eq!(h.entry(unit.id()).state, DatasetState::Pending);
    }

    #[tokio::test]
    async fn pool_drains_all_due_work() {
        let h = harness(test_config());
        for _ in 0..10 {
            h.produce("calexp", b"pixels");
        }
        discovered(&h).await;

        let (_tx, rx) = watch::channel(false);
        let report = WorkerPool::new(h.ctx.clone()).drain(rx).await.unwrap();
        assert_eq!(report.replicated, 10);
        assert_eq!(report.total(), 10);
        assert_eq!(h.destination.len(), 10);
        let replicated = h
            .ledger
            .scan(&EntryQuery::in_states([DatasetState::Replicated]))
            .unwrap();
        assert_eq!(replicated.len(), 10);
    }

    #[tokio::test]
    async fn pool_run_stops_on_shutdown() {
        let h = harness(test_config());
        h.produce("calexp", b"pixels");
        discovered(&h).await;

        let pool = Arc::new(WorkerPool::new(h.ctx.clone()));
        let (tx, rx) = watch::channel(false);
        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(rx).await })
        };
        for _ in 0..100 {
            if h.destination.len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(h.destination.len(), 1);
    }
}
