use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pps_types::{DatasetId, DatasetRef, Fingerprint};
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};
use crate::traits::{DatasetFilter, DeleteOutcome, ImportOutcome, RepositoryAdapter};
use crate::unit::{Metadata, TransferUnit};

const ARTIFACT_FILE: &str = "artifact.bin";
const MANIFEST_FILE: &str = "unit.json";
const STAGING_DIR: &str = ".staging";

/// Per-dataset manifest stored next to the artifact.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    reference: DatasetRef,
    metadata: Metadata,
}

/// Repository backed by a directory tree, one subdirectory per dataset:
///
/// ```text
/// <root>/<dataset-id>/artifact.bin
/// <root>/<dataset-id>/unit.json
/// ```
///
/// Imports and deletes go through `<root>/.staging` and a directory rename,
/// so an interrupted import never leaves a visible half-written dataset.
pub struct DirectoryRepository {
    name: String,
    root: PathBuf,
}

impl DirectoryRepository {
    /// Open (creating if needed) a repository rooted at `root`.
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> RepoResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a dataset directly, bypassing import semantics.
    pub async fn put(&self, unit: &TransferUnit) -> RepoResult<()> {
        self.write_unit(unit).await
    }

    fn dataset_dir(&self, id: &DatasetId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn staging_path(&self, id: &DatasetId) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(format!("{id}.{}", uuid::Uuid::new_v4().simple()))
    }

    async fn read_manifest(&self, id: &DatasetId) -> RepoResult<Manifest> {
        let path = self.dataset_dir(id).join(MANIFEST_FILE);
        let raw = tokio::fs::read(&path).await.map_err(|e| not_found(e, id))?;
        serde_json::from_slice(&raw).map_err(|e| RepoError::Corrupt {
            id: *id,
            reason: format!("unreadable manifest: {e}"),
        })
    }

    async fn read_unit(&self, id: &DatasetId) -> RepoResult<TransferUnit> {
        let manifest = self.read_manifest(id).await?;
        let artifact = tokio::fs::read(self.dataset_dir(id).join(ARTIFACT_FILE))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RepoError::Corrupt {
                    id: *id,
                    reason: "artifact missing".into(),
                },
                _ => RepoError::Io(e),
            })?;
        Ok(TransferUnit {
            reference: manifest.reference,
            artifact: Bytes::from(artifact),
            metadata: manifest.metadata,
        })
    }

    async fn write_unit(&self, unit: &TransferUnit) -> RepoResult<()> {
        let id = unit.reference.id;
        let staged = self.staging_path(&id);
        tokio::fs::create_dir_all(&staged).await?;

        let manifest = Manifest {
            reference: unit.reference.clone(),
            metadata: unit.metadata.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| RepoError::Serialization(e.to_string()))?;
        tokio::fs::write(staged.join(ARTIFACT_FILE), &unit.artifact).await?;
        tokio::fs::write(staged.join(MANIFEST_FILE), encoded).await?;

        let target = self.dataset_dir(&id);
        self.discard(&target).await?;
        tokio::fs::rename(&staged, &target).await?;
        Ok(())
    }

    /// Move `path` out of sight, then remove it. Returns `false` if absent.
    async fn discard(&self, path: &Path) -> RepoResult<bool> {
        let Some(name) = path.file_name() else {
            return Ok(false);
        };
        let trash = self.root.join(STAGING_DIR).join(format!(
            "{}.{}.trash",
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        match tokio::fs::rename(path, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_dir_all(&trash).await?;
        Ok(true)
    }
}

#[async_trait]
impl RepositoryAdapter for DirectoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_datasets(&self, filter: &DatasetFilter) -> RepoResult<Vec<DatasetRef>> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan_root(&root))
            .await
            .map_err(|e| RepoError::Unavailable(format!("listing task failed: {e}")))??;

        let mut refs = Vec::with_capacity(found.len());
        for (id, modified) in found {
            match self.read_manifest(&id).await {
                Ok(manifest) => {
                    let mut reference = manifest.reference;
                    if reference.observed_at.is_none() {
                        reference.observed_at = modified;
                    }
                    if filter.matches(&reference) {
                        refs.push(reference);
                    }
                }
                Err(RepoError::NotFound(_)) => {
                    tracing::debug!(repo = %self.name, dataset = %id, "dataset vanished during listing");
                }
                Err(RepoError::Corrupt { reason, .. }) => {
                    tracing::warn!(repo = %self.name, dataset = %id, %reason, "skipping unreadable dataset");
                }
                Err(e) => return Err(e),
            }
        }
        refs.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            refs.truncate(limit);
        }
        Ok(refs)
    }

    async fn export(&self, id: &DatasetId) -> RepoResult<TransferUnit> {
        self.read_unit(id).await
    }

    async fn import(&self, unit: &TransferUnit) -> RepoResult<ImportOutcome> {
        let id = unit.reference.id;
        match self.read_unit(&id).await {
            Ok(existing) => {
                if existing.reference.fingerprint != unit.reference.fingerprint {
                    return Err(RepoError::Conflict {
                        id,
                        existing: existing.reference.fingerprint,
                        incoming: unit.reference.fingerprint,
                    });
                }
                if existing.is_intact()? {
                    return Ok(ImportOutcome::AlreadyPresent);
                }
                tracing::warn!(repo = %self.name, dataset = %id, "replacing damaged copy");
            }
            Err(RepoError::NotFound(_)) => {}
            Err(RepoError::Corrupt { reason, .. }) => {
                tracing::warn!(repo = %self.name, dataset = %id, %reason, "replacing unreadable copy");
            }
            Err(e) => return Err(e),
        }
        self.write_unit(unit).await?;
        Ok(ImportOutcome::Imported)
    }

    async fn fingerprint(&self, id: &DatasetId) -> RepoResult<Fingerprint> {
        self.read_unit(id).await?.compute_fingerprint()
    }

    async fn delete(&self, id: &DatasetId) -> RepoResult<DeleteOutcome> {
        if self.discard(&self.dataset_dir(id)).await? {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }
}

/// Dataset directories directly under `root`, with their modification times.
fn scan_root(root: &Path) -> RepoResult<Vec<(DatasetId, Option<DateTime<Utc>>)>> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| RepoError::Io(io::Error::other(e.to_string())))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let Ok(id) = name.parse::<DatasetId>() else {
            tracing::debug!(path = %entry.path().display(), "ignoring foreign directory");
            continue;
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        found.push((id, modified));
    }
    Ok(found)
}

fn not_found(err: io::Error, id: &DatasetId) -> RepoError {
    match err.kind() {
        io::ErrorKind::NotFound => RepoError::NotFound(*id),
        _ => RepoError::Io(err),
    }
}
