use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;
use crate::fingerprint::Fingerprint;

/// Stable identifier of a dataset, assigned by the source repository.
///
/// The replication engine treats the identifier as opaque. It is the key of
/// the ledger and the idempotency key of destination imports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(Uuid);

impl DatasetId {
    /// Wrap an identifier issued by a repository.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create a random identifier for tests and demos.
    pub fn ephemeral() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl FromStr for DatasetId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TypeError::InvalidDatasetId(format!("{s}: {e}")))
    }
}

impl fmt::Debug for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatasetId({})", self.short_id())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for DatasetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Reference to a dataset held by a repository.
///
/// Captured once at discovery and never modified afterwards: the fingerprint
/// recorded here is the one every later verification is checked against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub id: DatasetId,
    pub fingerprint: Fingerprint,
    /// Name of the dataset type; selects the retention policy.
    pub dataset_type: String,
    /// End of the observation that produced the dataset, when known.
    pub observed_at: Option<DateTime<Utc>>,
}

impl DatasetRef {
    pub fn new(id: DatasetId, fingerprint: Fingerprint, dataset_type: impl Into<String>) -> Self {
        Self {
            id,
            fingerprint,
            dataset_type: dataset_type.into(),
            observed_at: None,
        }
    }

    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = Some(observed_at);
        self
    }
}
