//! Replication and lifecycle engine for the Prompt Publication Service.
//!
//! The engine moves datasets from a source repository to a destination
//! repository and later purges them from the source. Everything it knows is
//! recorded in a [`TransferLedger`](pps_ledger::TransferLedger); every
//! component is stateless apart from that ledger and can be restarted at
//! any point.
//!
//! # Components
//!
//! - [`DiscoveryWatcher`] -- registers new source datasets as `Pending`
//! - [`WorkerPool`] / [`TransferWorker`] -- claim due entries, then export,
//!   import and verify
//! - [`Reconciler`] -- releases lapsed claims and demotes replicated entries
//!   whose destination copy went missing
//! - [`RetentionManager`] -- deletes source copies once the retention window
//!   has elapsed
//! - [`Service`] -- runs all of the above on their intervals until shutdown
//! - [`Operator`] -- requeue, inspection and statistics
//!
//! # Failure handling
//!
//! Per-dataset failures are classified as [`TransferFailure`]s and recorded on
//! the entry with exponential backoff ([`BackoffPolicy`]). Ledger outages are
//! fatal and stop the service.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod operator;
pub mod reconciler;
pub mod retention;
pub mod service;
pub mod worker;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testkit;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, RetentionPolicy, ServiceConfig, TypeRetention};
pub use context::EngineContext;
pub use discovery::{DiscoveryReport, DiscoveryWatcher};
pub use error::{EngineError, EngineResult, Stage, TransferFailure};
pub use operator::{EntryView, Operator};
pub use reconciler::{ReconcileReport, Reconciler};
pub use retention::{PurgeDecision, RetentionManager, RetentionReport};
pub use service::{PassReport, Service};
pub use worker::{DrainReport, TransferWorker, WorkOutcome, WorkerPool};
