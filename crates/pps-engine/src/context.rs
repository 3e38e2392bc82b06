use std::future::Future;
use std::sync::Arc;

use pps_ledger::TransferLedger;
use pps_repo::{RepoError, RepoResult, RepositoryAdapter};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;

/// Collaborators shared by every engine component.
#[derive(Clone)]
pub struct EngineContext {
    pub source: Arc<dyn RepositoryAdapter>,
    pub destination: Arc<dyn RepositoryAdapter>,
    pub ledger: Arc<dyn TransferLedger>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    pub fn new(
        source: Arc<dyn RepositoryAdapter>,
        destination: Arc<dyn RepositoryAdapter>,
        ledger: Arc<dyn TransferLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run an adapter call under the configured timeout. An elapsed timeout
    /// is reported as [`RepoError::Timeout`].
    pub async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = RepoResult<T>>,
    ) -> RepoResult<T> {
        match tokio::time::timeout(self.config.adapter_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RepoError::Timeout { operation }),
        }
    }
}
