use pps_types::Fingerprint;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation, so its digests never collide with plain BLAKE3 digests of
/// the same bytes.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for whole datasets (artifact plus metadata).
    pub const DATASET: Self = Self {
        domain: "pps-dataset-v1",
    };

    /// Fingerprint a dataset from its artifact and metadata.
    ///
    /// The metadata is hashed as JSON; callers pass an ordered map so the
    /// encoding is canonical. The artifact length is hashed first so the
    /// boundary between the two parts is unambiguous.
    pub fn fingerprint_dataset<M: serde::Serialize>(
        &self,
        artifact: &[u8],
        metadata: &M,
    ) -> Result<Fingerprint, HasherError> {
        let encoded =
            serde_json::to_vec(metadata).map_err(|e| HasherError::Serialization(e.to_string()))?;
        let mut hasher = self.start();
        hasher.update(&(artifact.len() as u64).to_le_bytes());
        hasher.update(artifact);
        hasher.update(&encoded);
        Ok(Fingerprint::from_hash(*hasher.finalize().as_bytes()))
    }

    fn start(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),
}
