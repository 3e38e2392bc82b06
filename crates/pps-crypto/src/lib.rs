//! Content fingerprinting for the Prompt Publication Service.
//!
//! Fingerprints are domain-separated BLAKE3 digests. The dataset fingerprint
//! covers the artifact bytes and the dataset's own metadata, and nothing a
//! destination repository adds on import.

pub mod hasher;

pub use hasher::{ContentHasher, HasherError};
