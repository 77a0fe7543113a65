// src/integrity/mod.rs

//! Tamper-evident audit trail.
//!
//! - [`chain`] folds task payloads and artifacts into a SHA-256 chain.
//! - [`manifest`] durably records task outcomes (append, then finalize).

pub mod chain;
pub mod manifest;

pub use chain::{TaskChainer, chain_hash};
pub use manifest::{
    ArtifactStore, FinalizedManifest, FsArtifactStore, ManifestError, ManifestHandle,
    ManifestWriter, finalize_existing,
};
