use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pps_ledger::SyncMode;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Configuration errors, reported before any component starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retention rules for one dataset type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeRetention {
    /// Hours the source keeps a replicated dataset; the policy default
    /// when unset.
    pub window_hours: Option<u64>,
    /// Never purge datasets of this type from the source.
    pub retain_forever: bool,
    /// Hours after the dataset was produced before it may be transferred.
    pub transfer_delay_hours: u64,
}

/// Per-dataset-type retention, with a default for unlisted types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub default_window_hours: u64,
    pub per_type: BTreeMap<String, TypeRetention>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            default_window_hours: 24 * 30,
            per_type: BTreeMap::new(),
        }
    }
}

impl RetentionPolicy {
    /// The retention window for `dataset_type`; `None` means retain forever.
    pub fn window_for(&self, dataset_type: &str) -> Option<chrono::Duration> {
        let hours = match self.per_type.get(dataset_type) {
            Some(rule) if rule.retain_forever => return None,
            Some(rule) => rule.window_hours.unwrap_or(self.default_window_hours),
            None => self.default_window_hours,
        };
        Some(hours_to_duration(hours))
    }

    /// How long after production a dataset of `dataset_type` must wait
    /// before transfer.
    pub fn transfer_delay_for(&self, dataset_type: &str) -> chrono::Duration {
        let hours = self
            .per_type
            .get(dataset_type)
            .map_or(0, |rule| rule.transfer_delay_hours);
        hours_to_duration(hours)
    }
}

/// Longest window representable without timestamp overflow (1000 years).
const MAX_HOURS: u64 = 24 * 365 * 1000;

fn hours_to_duration(hours: u64) -> chrono::Duration {
    chrono::Duration::hours(hours.min(MAX_HOURS) as i64)
}

/// Engine tuning. Every field has a default, so an empty TOML document is
/// a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed attempts after which an entry becomes `Failed`.
    pub attempt_ceiling: u32,
    pub worker_count: usize,
    pub discovery_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub retention_interval_secs: u64,
    /// How long an idle worker waits before looking for work again.
    pub worker_poll_millis: u64,
    pub claim_ttl_secs: u64,
    /// A claim older than this is released even if it is still renewed.
    pub stuck_threshold_secs: u64,
    pub adapter_timeout_secs: u64,
    /// Replicated entries re-checked at the destination per reconcile pass.
    pub audit_batch_size: usize,
    /// Ledger entries fetched per scan when looking for work.
    pub scan_batch_size: usize,
    /// If set, only datasets of these types are discovered.
    pub dataset_types: Option<Vec<String>>,
    pub retention: RetentionPolicy,
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_ceiling: 5,
            worker_count: 4,
            discovery_interval_secs: 60,
            reconcile_interval_secs: 300,
            retention_interval_secs: 900,
            worker_poll_millis: 1000,
            claim_ttl_secs: 300,
            stuck_threshold_secs: 6 * 3600,
            adapter_timeout_secs: 600,
            audit_batch_size: 100,
            scan_batch_size: 64,
            dataset_types: None,
            retention: RetentionPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.worker_count == 0 {
            return invalid("worker_count must be at least 1");
        }
        if self.attempt_ceiling == 0 {
            return invalid("attempt_ceiling must be at least 1");
        }
        if self.backoff.base_secs == 0 {
            return invalid("backoff.base_secs must be positive");
        }
        if self.backoff.max_secs < self.backoff.base_secs {
            return invalid("backoff.max_secs must not be below backoff.base_secs");
        }
        if !(self.backoff.multiplier >= 1.0 && self.backoff.multiplier.is_finite()) {
            return invalid("backoff.multiplier must be a finite number >= 1");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return invalid("backoff.jitter must be within [0, 1]");
        }
        if self.claim_ttl_secs == 0 {
            return invalid("claim_ttl_secs must be positive");
        }
        if self.stuck_threshold_secs <= self.claim_ttl_secs {
            return invalid("stuck_threshold_secs must exceed claim_ttl_secs");
        }
        if self.adapter_timeout_secs == 0 {
            return invalid("adapter_timeout_secs must be positive");
        }
        if self.discovery_interval_secs == 0
            || self.reconcile_interval_secs == 0
            || self.retention_interval_secs == 0
        {
            return invalid("task intervals must be positive");
        }
        if self.scan_batch_size == 0 || self.audit_batch_size == 0 {
            return invalid("batch sizes must be positive");
        }
        if let Some((name, _)) = self
            .retention
            .per_type
            .iter()
            .find(|(_, rule)| rule.retain_forever && rule.window_hours.is_some())
        {
            return Err(ConfigError::Invalid(format!(
                "retention.per_type.{name}: window_hours conflicts with retain_forever"
            )));
        }
        let windows = std::iter::once(Some(self.retention.default_window_hours))
            .chain(self.retention.per_type.values().map(|rule| rule.window_hours));
        if windows.flatten().any(|hours| hours > MAX_HOURS) {
            return invalid("retention windows are limited to 1000 years");
        }
        Ok(())
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_ttl_secs as i64)
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Interval at which an active worker renews its claim.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.claim_ttl_secs * 1000 / 3).max(1))
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_millis.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

/// Everything the `pps` service needs to start: where the ledger lives,
/// the two repositories, and engine tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub ledger_path: PathBuf,
    #[serde(default)]
    pub ledger_sync: SyncMode,
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("pps-ledger.journal"),
            ledger_sync: SyncMode::default(),
            source_root: PathBuf::from("source"),
            destination_root: PathBuf::from("archive"),
            engine: EngineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
