use std::collections::BTreeMap;

use bytes::Bytes;
use pps_crypto::ContentHasher;
use pps_types::{DatasetId, DatasetRef, Fingerprint};
use serde_json::Value;

use crate::error::{RepoError, RepoResult};

/// Dataset metadata, ordered so its encoding is canonical.
pub type Metadata = BTreeMap<String, Value>;

/// A dataset packaged for transfer between repositories.
///
/// The unit carries the reference it was exported under; its fingerprint is
/// the one the source declared, which [`TransferUnit::compute_fingerprint`]
/// lets a receiver check against the bytes actually carried.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferUnit {
    pub reference: DatasetRef,
    pub artifact: Bytes,
    pub metadata: Metadata,
}

impl TransferUnit {
    /// Package a dataset, fingerprinting its content.
    pub fn new(
        id: DatasetId,
        dataset_type: impl Into<String>,
        artifact: impl Into<Bytes>,
        metadata: Metadata,
    ) -> RepoResult<Self> {
        let artifact = artifact.into();
        let fingerprint = fingerprint_content(&artifact, &metadata)?;
        Ok(Self {
            reference: DatasetRef::new(id, fingerprint, dataset_type),
            artifact,
            metadata,
        })
    }

    pub fn id(&self) -> &DatasetId {
        &self.reference.id
    }

    /// Recompute the fingerprint of the carried content.
    pub fn compute_fingerprint(&self) -> RepoResult<Fingerprint> {
        fingerprint_content(&self.artifact, &self.metadata)
    }

    /// Returns `true` if the carried content matches the declared fingerprint.
    pub fn is_intact(&self) -> RepoResult<bool> {
        Ok(self.compute_fingerprint()? == self.reference.fingerprint)
    }

    /// Total payload size in bytes (artifact only).
    pub fn size(&self) -> u64 {
        self.artifact.len() as u64
    }
}

pub(crate) fn fingerprint_content(artifact: &[u8], metadata: &Metadata) -> RepoResult<Fingerprint> {
    ContentHasher::DATASET
        .fingerprint_dataset(artifact, metadata)
        .map_err(|e| RepoError::Serialization(e.to_string()))
}
