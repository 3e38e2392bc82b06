use async_trait::async_trait;
use pps_types::{DatasetId, DatasetRef, Fingerprint};

use crate::error::RepoResult;
use crate::unit::TransferUnit;

/// Selection criteria for [`RepositoryAdapter::list_datasets`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetFilter {
    /// If set, only datasets of these types are listed.
    pub dataset_types: Option<Vec<String>>,
    /// If set, at most this many datasets are listed.
    pub limit: Option<usize>,
}

impl DatasetFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dataset_types: Some(types.into_iter().map(Into::into).collect()),
            limit: None,
        }
    }

    /// Returns `true` if the given reference matches this filter.
    pub fn matches(&self, reference: &DatasetRef) -> bool {
        match &self.dataset_types {
            Some(types) => types.iter().any(|t| *t == reference.dataset_type),
            None => true,
        }
    }
}

/// Outcome of a successful import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The dataset was written (or an incomplete copy was repaired).
    Imported,
    /// An identical copy was already present; nothing was written.
    AlreadyPresent,
}

/// Outcome of a successful delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing to delete; treated as success.
    AlreadyAbsent,
}

/// Uniform capability exposed by source and destination repositories.
///
/// Implementations must satisfy these invariants:
/// - `import` is keyed on the dataset identifier. Importing a unit whose
///   identical copy is already present is a no-op returning
///   [`ImportOutcome::AlreadyPresent`]; a present copy whose content does not
///   match its declared fingerprint (a torn earlier import) is replaced.
///   A different dataset under the same identifier is a
///   [`RepoError::Conflict`](crate::RepoError::Conflict).
/// - `fingerprint` recomputes the digest from stored content; it never
///   echoes the declared value.
/// - `delete` of an absent dataset returns [`DeleteOutcome::AlreadyAbsent`].
/// - Missing datasets are reported as
///   [`RepoError::NotFound`](crate::RepoError::NotFound) by `export` and
///   `fingerprint`.
#[async_trait]
pub trait RepositoryAdapter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn list_datasets(&self, filter: &DatasetFilter) -> RepoResult<Vec<DatasetRef>>;

    async fn export(&self, id: &DatasetId) -> RepoResult<TransferUnit>;

    async fn import(&self, unit: &TransferUnit) -> RepoResult<ImportOutcome>;

    async fn fingerprint(&self, id: &DatasetId) -> RepoResult<Fingerprint>;

    async fn delete(&self, id: &DatasetId) -> RepoResult<DeleteOutcome>;
}
