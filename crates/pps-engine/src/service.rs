use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::discovery::{DiscoveryReport, DiscoveryWatcher};
use crate::error::{EngineError, EngineResult};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::retention::{RetentionManager, RetentionReport};
use crate::worker::{DrainReport, WorkerPool};

/// Results of one full pass over every component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub discovery: DiscoveryReport,
    pub transfers: DrainReport,
    pub reconcile: ReconcileReport,
    pub retention: RetentionReport,
}

/// The running replication service: discovery, reconcile and retention on
/// their own intervals plus the transfer worker pool.
pub struct Service {
    ctx: EngineContext,
    discovery: Arc<DiscoveryWatcher>,
    pool: Arc<WorkerPool>,
    reconciler: Arc<Reconciler>,
    retention: Arc<RetentionManager>,
}

impl Service {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            discovery: Arc::new(DiscoveryWatcher::new(ctx.clone())),
            pool: Arc::new(WorkerPool::new(ctx.clone())),
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            retention: Arc::new(RetentionManager::new(ctx.clone())),
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Discovery, transfers until nothing is claimable, reconcile, then
    /// retention.
    pub async fn run_once(&self) -> EngineResult<PassReport> {
        let (_stop, rx) = watch::channel(false);
        let discovery = self.discovery.run_once().await?;
        let transfers = self.pool.drain(rx).await?;
        let reconcile = self.reconciler.run_once().await?;
        let retention = self.retention.run_once().await?;
        Ok(PassReport {
            discovery,
            transfers,
            reconcile,
            retention,
        })
    }

    /// Run until `shutdown` turns true or a fatal error occurs. In-flight
    /// transfers are cancelled and their claims released before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        let config = &self.ctx.config;
        info!(
            source = self.ctx.source.name(),
            destination = self.ctx.destination.name(),
            workers = config.worker_count,
            "service started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<EngineResult<()>> = JoinSet::new();

        let discovery = self.discovery.clone();
        tasks.spawn(periodic(
            "discovery",
            config.discovery_interval(),
            stop_rx.clone(),
            move || {
                let discovery = discovery.clone();
                async move { discovery.run_once().await.map(drop) }
            },
        ));
        let reconciler = self.reconciler.clone();
        tasks.spawn(periodic(
            "reconcile",
            config.reconcile_interval(),
            stop_rx.clone(),
            move || {
                let reconciler = reconciler.clone();
                async move { reconciler.run_once().await.map(drop) }
            },
        ));
        let retention = self.retention.clone();
        tasks.spawn(periodic(
            "retention",
            config.retention_interval(),
            stop_rx.clone(),
            move || {
                let retention = retention.clone();
                async move { retention.run_once().await.map(drop) }
            },
        ));
        let pool = self.pool.clone();
        let pool_rx = stop_rx.clone();
        tasks.spawn(async move { pool.run(pool_rx).await });

        let mut failure = None;
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                info!("shutdown requested");
            }
            Some(joined) = tasks.join_next() => {
                failure = task_error(joined);
                if failure.is_none() {
                    warn!("engine task exited early; stopping service");
                }
            }
        }

        // Receivers may already be gone if every task exited.
        let _ = stop_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            if let Some(e) = task_error(joined) {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => {
                error!(error = %e, "service stopped on fatal error");
                Err(e)
            }
            None => {
                info!("service stopped");
                Ok(())
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn task_error(joined: Result<EngineResult<()>, tokio::task::JoinError>) -> Option<EngineError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(EngineError::Task(e.to_string())),
    }
}

/// Run `pass` every `period` until `stop`. Non-fatal errors are logged and
/// the next tick retries; a fatal error ends the loop.
async fn periodic<F, Fut>(
    task: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut pass: F,
) -> EngineResult<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = EngineResult<()>> + Send,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() || stop.has_changed().is_err() {
            break;
        }
        match pass().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(task, error = %e, "fatal error");
                return Err(e);
            }
            Err(e) => warn!(task, error = %e, "pass failed; retrying next tick"),
        }
    }
    debug!(task, "stopped");
    Ok(())
}
