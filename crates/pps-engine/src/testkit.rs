//! Shared fixtures for engine tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pps_ledger::InMemoryLedger;
use pps_repo::{InMemoryRepository, Metadata, TransferUnit};
use pps_types::{DatasetId, LedgerEntry};

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::context::EngineContext;

pub(crate) struct Harness {
    pub source: Arc<InMemoryRepository>,
    pub destination: Arc<InMemoryRepository>,
    pub ledger: Arc<InMemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub ctx: EngineContext,
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 12, 4, 0, 0).unwrap()
}

/// Defaults tuned for tests: short timeouts and a fixed backoff.
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig {
        worker_count: 2,
        adapter_timeout_secs: 5,
        worker_poll_millis: 10,
        ..EngineConfig::default()
    };
    config.backoff.jitter = 0.0;
    config.backoff.base_secs = 10;
    config.backoff.max_secs = 600;
    config.retention.default_window_hours = 24;
    config
}

pub(crate) fn harness(config: EngineConfig) -> Harness {
    let source = Arc::new(InMemoryRepository::new("source"));
    let destination = Arc::new(InMemoryRepository::new("destination"));
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let ctx = EngineContext::new(source.clone(), destination.clone(), ledger.clone(), config)
        .with_clock(clock.clone());
    Harness {
        source,
        destination,
        ledger,
        clock,
        ctx,
    }
}

impl Harness {
    /// Put a new dataset of `dataset_type` at the source.
    pub fn produce(&self, dataset_type: &str, artifact: &'static [u8]) -> TransferUnit {
        let mut metadata = Metadata::new();
        metadata.insert("instrument".into(), "LSSTCam".into());
        let unit = TransferUnit::new(DatasetId::ephemeral(), dataset_type, artifact, metadata)
            .unwrap();
        self.source.insert(unit.clone()).unwrap();
        unit
    }

    pub fn entry(&self, id: &DatasetId) -> LedgerEntry {
        use pps_ledger::TransferLedger;
        self.ledger.get(id).unwrap().unwrap()
    }
}
