//! Foundation types for the Prompt Publication Service (PPS).
//!
//! This crate provides the identity, fingerprint and lifecycle types shared
//! by every other PPS crate.
//!
//! # Key Types
//!
//! - [`DatasetId`] -- stable identifier assigned by the source repository
//! - [`Fingerprint`] -- BLAKE3 content fingerprint used for verification
//! - [`DatasetRef`] -- immutable reference captured at discovery
//! - [`DatasetState`] -- lifecycle state machine
//! - [`LedgerEntry`] -- authoritative lifecycle record of one dataset
//! - [`Claim`] -- time-bounded exclusive right to act on an entry

pub mod claim;
pub mod dataset;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod state;

pub use claim::{Claim, ClaimToken};
pub use dataset::{DatasetId, DatasetRef};
pub use entry::LedgerEntry;
pub use error::TypeError;
pub use fingerprint::Fingerprint;
pub use state::DatasetState;
