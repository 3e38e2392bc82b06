use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use pps_types::{DatasetId, DatasetRef, Fingerprint};

use crate::error::{RepoError, RepoResult};
use crate::traits::{DatasetFilter, DeleteOutcome, ImportOutcome, RepositoryAdapter};
use crate::unit::TransferUnit;

/// Adapter operation a [`Fault`] can be injected into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Export,
    Import,
    Fingerprint,
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Export => "export",
            Self::Import => "import",
            Self::Fingerprint => "fingerprint",
            Self::Delete => "delete",
        }
    }
}

/// A failure injected into the next call of an [`Operation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`RepoError::Unavailable`].
    Unavailable,
    /// Fail with [`RepoError::NotFound`].
    NotFound,
    /// Fail with [`RepoError::Conflict`].
    Conflict,
    /// Sleep before running the operation normally.
    Stall(Duration),
}

/// In-memory, HashMap-based repository.
///
/// Intended for tests, demos and embedding. Datasets are held behind a
/// `RwLock` and cloned on read and write. Faults can be queued per
/// operation to exercise the engine's failure handling.
pub struct InMemoryRepository {
    name: String,
    datasets: RwLock<HashMap<DatasetId, TransferUnit>>,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    corrupt_imports: Mutex<HashMap<DatasetId, u32>>,
    available: AtomicBool,
    imports: AtomicU64,
}

impl InMemoryRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datasets: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            corrupt_imports: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            imports: AtomicU64::new(0),
        }
    }

    /// Store a dataset directly, bypassing import semantics.
    pub fn insert(&self, unit: TransferUnit) -> RepoResult<()> {
        self.datasets
            .write()
            .map_err(|_| poisoned())?
            .insert(unit.reference.id, unit);
        Ok(())
    }

    /// Remove a dataset directly. Returns `true` if it was present.
    pub fn remove(&self, id: &DatasetId) -> RepoResult<bool> {
        Ok(self
            .datasets
            .write()
            .map_err(|_| poisoned())?
            .remove(id)
            .is_some())
    }

    /// Flip one byte of a stored artifact so its content no longer matches
    /// the declared fingerprint. Returns `false` if the dataset is absent.
    pub fn tamper(&self, id: &DatasetId) -> RepoResult<bool> {
        let mut map = self.datasets.write().map_err(|_| poisoned())?;
        match map.get_mut(id) {
            Some(unit) => {
                unit.artifact = damaged(&unit.artifact);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, id: &DatasetId) -> RepoResult<Option<TransferUnit>> {
        Ok(self.datasets.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.datasets
            .read()
            .map(|map| map.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.datasets.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of imports that actually wrote data.
    pub fn import_count(&self) -> u64 {
        self.imports.load(Ordering::SeqCst)
    }

    /// While unavailable every operation fails with [`RepoError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queue `fault` for the next `times` calls of `op`.
    pub fn inject(&self, op: Operation, fault: Fault, times: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults
                .entry(op)
                .or_default()
                .extend(std::iter::repeat(fault).take(times));
        }
    }

    /// Queue `fault` for the next call of `op`.
    pub fn fail_next(&self, op: Operation, fault: Fault) {
        self.inject(op, fault, 1);
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// The next `times` imports of `id` store damaged content while
    /// reporting success.
    pub fn corrupt_on_import(&self, id: DatasetId, times: u32) {
        if let Ok(mut corrupt) = self.corrupt_imports.lock() {
            *corrupt.entry(id).or_default() += times;
        }
    }

    async fn check(&self, op: Operation, id: Option<&DatasetId>) -> RepoResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable(format!("{} is offline", self.name)));
        }
        let fault = self
            .faults
            .lock()
            .map_err(|_| poisoned())?
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        let Some(fault) = fault else {
            return Ok(());
        };
        tracing::debug!(repo = %self.name, op = op.as_str(), ?fault, "injected fault");
        match (fault, id) {
            (Fault::Stall(delay), _) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            (Fault::NotFound, Some(id)) => Err(RepoError::NotFound(*id)),
            (Fault::Conflict, Some(id)) => {
                let stored = Fingerprint::from_hash([0; 32]);
                Err(RepoError::Conflict {
                    id: *id,
                    existing: stored,
                    incoming: stored,
                })
            }
            (_, _) => Err(RepoError::Unavailable(format!(
                "injected {} failure",
                op.as_str()
            ))),
        }
    }

    fn take_corruption(&self, id: &DatasetId) -> RepoResult<bool> {
        let mut corrupt = self.corrupt_imports.lock().map_err(|_| poisoned())?;
        match corrupt.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl RepositoryAdapter for InMemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_datasets(&self, filter: &DatasetFilter) -> RepoResult<Vec<DatasetRef>> {
        self.check(Operation::List, None).await?;
        let map = self.datasets.read().map_err(|_| poisoned())?;
        let mut refs: Vec<DatasetRef> = map
            .values()
            .map(|unit| unit.reference.clone())
            .filter(|r| filter.matches(r))
            .collect();
        refs.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            refs.truncate(limit);
        }
        Ok(refs)
    }

    async fn export(&self, id: &DatasetId) -> RepoResult<TransferUnit> {
        self.check(Operation::Export, Some(id)).await?;
        self.get(id)?.ok_or(RepoError::NotFound(*id))
    }

    async fn import(&self, unit: &TransferUnit) -> RepoResult<ImportOutcome> {
        let id = unit.reference.id;
        self.check(Operation::Import, Some(&id)).await?;
        let corrupt = self.take_corruption(&id)?;

        let mut map = self.datasets.write().map_err(|_| poisoned())?;
        if let Some(existing) = map.get(&id) {
            if existing.reference.fingerprint != unit.reference.fingerprint {
                return Err(RepoError::Conflict {
                    id,
                    existing: existing.reference.fingerprint,
                    incoming: unit.reference.fingerprint,
                });
            }
            if !corrupt && existing.is_intact()? {
                return Ok(ImportOutcome::AlreadyPresent);
            }
        }

        let mut stored = unit.clone();
        if corrupt {
            stored.artifact = damaged(&stored.artifact);
        }
        map.insert(id, stored);
        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(ImportOutcome::Imported)
    }

    async fn fingerprint(&self, id: &DatasetId) -> RepoResult<Fingerprint> {
        self.check(Operation::Fingerprint, Some(id)).await?;
        let unit = self.get(id)?.ok_or(RepoError::NotFound(*id))?;
        unit.compute_fingerprint()
    }

    async fn delete(&self, id: &DatasetId) -> RepoResult<DeleteOutcome> {
        self.check(Operation::Delete, Some(id)).await?;
        if self.remove(id)? {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }
}

fn poisoned() -> RepoError {
    RepoError::Unavailable("repository lock poisoned".into())
}

fn damaged(artifact: &[u8]) -> bytes::Bytes {
    let mut buf = BytesMut::with_capacity(artifact.len() + 1);
    buf.put_slice(artifact);
    match buf.last_mut() {
        Some(last) => *last ^= 0xFF,
        None => buf.put_u8(0xFF),
    }
    buf.freeze()
}
