use chrono::{DateTime, Utc};
use pps_repo::DatasetFilter;
use pps_types::DatasetRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetentionPolicy;
use crate::context::EngineContext;
use crate::error::EngineResult;

/// Outcome of one discovery pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub listed: usize,
    pub registered: usize,
    pub already_known: usize,
    /// Set when the source could not be listed; nothing was registered.
    pub listing_error: Option<String>,
}

/// Registers datasets present at the source that the ledger does not know.
///
/// Discovery only inserts. A listing failure is reported and retried on the
/// next pass; it is never read as "the source is empty".
pub struct DiscoveryWatcher {
    ctx: EngineContext,
}

impl DiscoveryWatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run_once(&self) -> EngineResult<DiscoveryReport> {
        let filter = DatasetFilter {
            dataset_types: self.ctx.config.dataset_types.clone(),
            limit: None,
        };
        let source = &self.ctx.source;
        let listing = match self.ctx.bounded("list", source.list_datasets(&filter)).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(repo = source.name(), error = %e, "source listing failed; will retry next pass");
                return Ok(DiscoveryReport {
                    listing_error: Some(e.to_string()),
                    ..DiscoveryReport::default()
                });
            }
        };

        let mut report = DiscoveryReport {
            listed: listing.len(),
            ..DiscoveryReport::default()
        };
        for reference in &listing {
            let now = self.ctx.clock.now();
            let eligible_at = eligible_at(&self.ctx.config.retention, reference, now);
            if self.ctx.ledger.register(reference, now, eligible_at)? {
                report.registered += 1;
                info!(
                    dataset = %reference.id,
                    dataset_type = %reference.dataset_type,
                    eligible_at = ?eligible_at,
                    "dataset discovered"
                );
            } else {
                report.already_known += 1;
            }
        }
        debug!(
            listed = report.listed,
            registered = report.registered,
            "discovery pass complete"
        );
        Ok(report)
    }
}

/// Earliest transfer time for a newly discovered dataset, if its type
/// carries a transfer delay.
fn eligible_at(
    policy: &RetentionPolicy,
    reference: &DatasetRef,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let delay = policy.transfer_delay_for(&reference.dataset_type);
    if delay.is_zero() {
        return None;
    }
    Some(reference.observed_at.unwrap_or(now) + delay)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use pps_ledger::TransferLedger;
    use pps_repo::{Fault, Operation};
    use pps_types::DatasetState;

    use super::*;
    use crate::config::TypeRetention;
    use crate::testkit::{harness, t0, test_config};

    #[tokio::test]
    async fn registers_new_datasets_once() {
        let h = harness(test_config());
        let a = h.produce("calexp", b"a");
        let watcher = DiscoveryWatcher::new(h.ctx.clone());

        let first = watcher.run_once().await.unwrap();
        assert_eq!(first.registered, 1);

        let b = h.produce("calexp", b"b");
        let second = watcher.run_once().await.unwrap();
        assert_eq!(second.listed, 2);
        assert_eq!(second.registered, 1);
        assert_eq!(second.already_known, 1);

        assert_eq!(h.entry(a.id()).state, DatasetState::Pending);
        assert_eq!(h.entry(b.id()).discovered_at, t0());
    }

    #[tokio::test]
    async fn rediscovery_never_touches_existing_entries() {
        let h = harness(test_config());
        let a = h.produce("calexp", b"a");
        let watcher = DiscoveryWatcher::new(h.ctx.clone());
        watcher.run_once().await.unwrap();
        let before = h.entry(a.id());

        h.clock.advance(Duration::hours(1));
        watcher.run_once().await.unwrap();
        assert_eq!(h.entry(a.id()), before);
    }

    #[tokio::test]
    async fn concurrent_passes_register_each_dataset_once() {
        let h = harness(test_config());
        for _ in 0..20 {
            h.produce("calexp", b"x");
        }
        let watcher = Arc::new(DiscoveryWatcher::new(h.ctx.clone()));
        let passes: Vec<_> = (0..4)
            .map(|_| {
                let w = watcher.clone();
                tokio::spawn(async move { w.run_once().await.unwrap() })
            })
            .collect();
        let mut registered = 0;
        for pass in passes {
            registered += pass.await.unwrap().registered;
        }
        assert_eq!(registered, 20);
        assert_eq!(h.ledger.len().unwrap(), 20);
    }

    #[tokio::test]
    async fn listing_failure_is_reported_not_treated_as_empty() {
        let h = harness(test_config());
        h.produce("calexp", b"a");
        h.source.fail_next(Operation::List, Fault::Unavailable);
        let watcher = DiscoveryWatcher::new(h.ctx.clone());

        let report = watcher.run_once().await.unwrap();
        assert!(report.listing_error.is_some());
        assert_eq!(report.registered, 0);
        assert_eq!(h.ledger.len().unwrap(), 0);

        let report = watcher.run_once().await.unwrap();
        assert_eq!(report.registered, 1);
    }

    #[tokio::test]
    async fn transfer_delay_sets_eligibility() {
        let mut config = test_config();
        config.retention.per_type.insert(
            "raw".into(),
            TypeRetention {
                window_hours: Some(24),
                transfer_delay_hours: 80,
                ..TypeRetention::default()
            },
        );
        let h = harness(config);
        let raw = h.produce("raw", b"r");
        let calexp = h.produce("calexp", b"c");
        DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();

        assert_eq!(h.entry(raw.id()).next_attempt_at, Some(t0() + Duration::hours(80)));
        assert_eq!(h.entry(calexp.id()).next_attempt_at, None);
    }

    #[tokio::test]
    async fn type_filter_limits_discovery() {
        let mut config = test_config();
        config.dataset_types = Some(vec!["calexp".into()]);
        let h = harness(config);
        h.produce("calexp", b"c");
        h.produce("raw", b"r");
        let report = DiscoveryWatcher::new(h.ctx.clone()).run_once().await.unwrap();
        assert_eq!(report.listed, 1);
        assert_eq!(h.ledger.len().unwrap(), 1);
    }
}
