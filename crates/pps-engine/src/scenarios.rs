//! End-to-end lifecycle runs across discovery, workers, reconciler and
//! retention.

use std::sync::Arc;

use chrono::Duration;
use pps_ledger::{JournaledLedger, SyncMode, TransferLedger};
use pps_repo::{Fault, InMemoryRepository, Metadata, Operation, RepositoryAdapter, TransferUnit};
use pps_types::{DatasetId, DatasetState};
use tokio::sync::watch;

use crate::clock::{Clock, ManualClock};
use crate::context::EngineContext;
use crate::discovery::DiscoveryWatcher;
use crate::reconciler::Reconciler;
use crate::retention::PurgeDecision;
use crate::service::Service;
use crate::testkit::{harness, t0, test_config, Harness};
use crate::worker::{DrainReport, TransferWorker, WorkerPool};

async fn drain(h: &Harness) -> DrainReport {
    let (_tx, rx) = watch::channel(false);
    WorkerPool::new(h.ctx.clone()).drain(rx).await.unwrap()
}

#[tokio::test]
async fn transient_failures_then_success() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    h.destination.inject(Operation::Import, Fault::Unavailable, 2);
    DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();

    for _ in 0..3 {
        drain(&h).await;
        h.clock.advance(Duration::minutes(10));
    }

    let entry = h.entry(unit.id());
    assert_eq!(entry.state, DatasetState::Replicated);
    assert_eq!(entry.attempt_count, 3);
    assert!(entry.last_error.is_none());
}

#[tokio::test]
async fn purge_waits_for_the_retention_window() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    let service = Service::new(h.ctx.clone());
    service.run_once().await.unwrap();
    assert_eq!(h.entry(unit.id()).completed_at, Some(t0()));

    h.clock.set(t0() + Duration::hours(23) + Duration::minutes(59));
    let decision = service.retention().purge(unit.id()).await.unwrap();
    assert!(matches!(decision, PurgeDecision::Deferred { .. }));
    assert!(h.source.contains(unit.id()));

    h.clock.set(t0() + Duration::hours(24) + Duration::minutes(1));
    let report = service.run_once().await.unwrap();
    assert_eq!(report.retention.purged, 1);
    assert!(!h.source.contains(unit.id()));
    assert_eq!(h.entry(unit.id()).state, DatasetState::Purged);
}

#[tokio::test]
async fn permanent_failures_end_in_failed() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    h.destination.inject(Operation::Import, Fault::Conflict, 5);
    let service = Service::new(h.ctx.clone());

    for _ in 0..6 {
        service.run_once().await.unwrap();
        h.clock.advance(Duration::hours(2));
    }

    let entry = h.entry(unit.id());
    assert_eq!(entry.state, DatasetState::Failed);
    assert_eq!(entry.attempt_count, 5);
    assert!(entry.completed_at.is_none());
    assert!(!h.destination.contains(unit.id()));
    assert!(h.source.contains(unit.id()));

    h.clock.advance(Duration::days(30));
    assert_eq!(
        service.retention().purge(unit.id()).await.unwrap(),
        PurgeDecision::NotReplicated {
            state: DatasetState::Failed
        }
    );
}

#[tokio::test]
async fn lost_destination_copy_is_replicated_again() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    let service = Service::new(h.ctx.clone());
    service.run_once().await.unwrap();
    assert_eq!(h.entry(unit.id()).state, DatasetState::Replicated);

    h.destination.remove(unit.id()).unwrap();
    h.clock.advance(Duration::hours(1));
    let report = Reconciler::new(h.ctx.clone()).run_once().await.unwrap();
    assert_eq!(report.demoted, 1);
    assert_eq!(h.entry(unit.id()).state, DatasetState::Retrying);

    // Not purgeable while demoted, even after the original deadline.
    h.clock.advance(Duration::hours(30));
    assert!(matches!(
        service.retention().purge(unit.id()).await.unwrap(),
        PurgeDecision::NotReplicated { .. }
    ));

    let drained = drain(&h).await;
    assert_eq!(drained.replicated, 1);
    let entry = h.entry(unit.id());
    assert_eq!(entry.state, DatasetState::Replicated);
    assert_eq!(entry.demotions, 1);
    assert!(h.destination.contains(unit.id()));
    assert!(h.source.contains(unit.id()));
}

#[tokio::test]
async fn crash_after_import_recovers_without_reimport() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();

    // A worker claims the entry and imports, then dies before recording.
    let crashed = TransferWorker::new(h.ctx.clone(), "crashed");
    crashed.claim_next().unwrap().unwrap();
    h.destination.import(&unit).await.unwrap();
    assert_eq!(h.destination.import_count(), 1);

    // Nobody else can take it while the claim is live.
    assert_eq!(drain(&h).await.total(), 0);

    h.clock.advance(h.ctx.config.claim_ttl());
    let report = Reconciler::new(h.ctx.clone()).run_once().await.unwrap();
    assert_eq!(report.claims_released, 1);

    let drained = drain(&h).await;
    assert_eq!(drained.replicated, 1);
    assert_eq!(h.destination.import_count(), 1);
    let entry = h.entry(unit.id());
    assert_eq!(entry.state, DatasetState::Replicated);
    assert_eq!(entry.attempt_count, 2);
}

#[tokio::test]
async fn expired_claim_is_retried_without_reconciler() {
    let h = harness(test_config());
    let unit = h.produce("calexp", b"a");
    DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();
    TransferWorker::new(h.ctx.clone(), "gone")
        .claim_next()
        .unwrap()
        .unwrap();

    h.clock.advance(h.ctx.config.claim_ttl());
    let drained = drain(&h).await;
    assert_eq!(drained.replicated, 1);
    assert_eq!(h.entry(unit.id()).state, DatasetState::Replicated);
}

#[tokio::test]
async fn journaled_ledger_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.journal");
    let source = Arc::new(InMemoryRepository::new("source"));
    let destination = Arc::new(InMemoryRepository::new("destination"));
    let clock = Arc::new(ManualClock::new(t0()));
    let context = |ledger: Arc<JournaledLedger>| {
        EngineContext::new(source.clone(), destination.clone(), ledger, test_config())
            .with_clock(clock.clone())
    };

    let first = TransferUnit::new(DatasetId::ephemeral(), "calexp", &b"a"[..], Metadata::new()).unwrap();
    source.insert(first.clone()).unwrap();
    {
        let ledger = Arc::new(JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap());
        let report = Service::new(context(ledger)).run_once().await.unwrap();
        assert_eq!(report.transfers.replicated, 1);
    }

    let ledger = Arc::new(JournaledLedger::open(&path, SyncMode::EveryWrite).unwrap());
    let entry = ledger.get(first.id()).unwrap().unwrap();
    assert_eq!(entry.state, DatasetState::Replicated);
    assert_eq!(entry.retention_deadline, Some(t0() + Duration::hours(24)));

    clock.advance(Duration::hours(25));
    let report = Service::new(context(ledger.clone())).run_once().await.unwrap();
    assert_eq!(report.discovery.registered, 0);
    assert_eq!(report.transfers.total(), 0);
    assert_eq!(report.retention.purged, 1);
    assert_eq!(
        ledger.get(first.id()).unwrap().unwrap().purged_at,
        Some(clock.now())
    );
}
