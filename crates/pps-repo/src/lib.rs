//! Repository adapter boundary for the Prompt Publication Service.
//!
//! The replication engine never talks to a storage engine directly. Source
//! and destination repositories are both reached through the
//! [`RepositoryAdapter`] trait: list, export, import, fingerprint, delete.
//!
//! # Adapters
//!
//! - [`InMemoryRepository`] -- `HashMap`-based, with fault injection for tests
//! - [`DirectoryRepository`] -- one directory per dataset on a local filesystem
//!
//! # Contract
//!
//! 1. Import is keyed on the dataset identifier; re-importing an identical
//!    copy is a no-op and a torn copy is repaired.
//! 2. Fingerprints are recomputed from stored content, never echoed.
//! 3. Deleting an absent dataset succeeds with [`DeleteOutcome::AlreadyAbsent`].

pub mod directory;
pub mod error;
pub mod memory;
pub mod traits;
pub mod unit;

pub use directory::DirectoryRepository;
pub use error::{RepoError, RepoResult};
pub use memory::{Fault, InMemoryRepository, Operation};
pub use traits::{DatasetFilter, DeleteOutcome, ImportOutcome, RepositoryAdapter};
pub use unit::{Metadata, TransferUnit};
