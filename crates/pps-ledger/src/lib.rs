//! Transfer ledger for the Prompt Publication Service (PPS).
//!
//! The ledger is the single source of truth for what has happened to every
//! dataset. This crate provides:
//! - The [`TransferLedger`] trait boundary with versioned compare-and-swap
//! - Transition validation enforced inside every write
//! - [`InMemoryLedger`] for tests and embedding
//! - [`JournaledLedger`], durable via a CRC-framed append-only journal
//! - Projections ([`LedgerStats`]) and an at-rest invariant audit

pub mod error;
pub mod journal;
pub mod journaled;
pub mod memory;
pub mod projection;
pub mod traits;
pub mod validation;

pub use error::{LedgerError, LedgerResult};
pub use journal::SyncMode;
pub use journaled::{CompactionReport, JournaledLedger};
pub use memory::InMemoryLedger;
pub use projection::{LedgerStats, ProjectionBuilder};
pub use traits::{EntryQuery, TransferLedger};
pub use validation::{validate_transition, LedgerValidator, ValidationReport, Violation, ViolationKind};
