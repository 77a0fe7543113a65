// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::dag::graph::GraphError;
use crate::integrity::manifest::ManifestError;
use crate::metrics::MetricsError;
use crate::queue::QueueError;
use crate::scheduler::predicate::PredicateError;
use crate::scheduler::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkdagError {
    /// Malformed submission; rejected before anything is persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A control operation or lookup referenced an unknown task id.
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Predicate(#[from] PredicateError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkdagError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkdagError::Queue(e) => e.is_retryable(),
            WorkdagError::IoError(_) => true,
            _ => false,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, WorkdagError>;
