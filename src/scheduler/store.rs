// src/scheduler/store.rs

//! Persistence seam for [`TaskRun`] records.
//!
//! Every state change goes through [`RunStore::apply`], which runs the
//! mutation on a copy and commits it only when the mutation succeeds. No
//! caller ever observes a half-applied transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::task::TaskRun;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("task run '{0}' not found")]
    NotFound(String),

    /// Another run already uses this id (with a different spec hash).
    #[error("task id '{0}' is already taken")]
    DuplicateId(String),
}

/// Outcome of one per-task mutation inside [`RunStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(TaskRun),
    Rejected { id: String, reason: String },
}

/// Per-task mutation: `Err(reason)` leaves the run untouched.
pub type Mutation<'a> = &'a mut dyn FnMut(&mut TaskRun) -> Result<(), String>;

pub trait RunStore: Send + Sync {
    /// Insert `run` unless `(tenant, spec_hash)` is already present.
    ///
    /// Returns the stored run and whether it was created by this call.
    fn insert_unique(&self, run: TaskRun) -> Result<(TaskRun, bool), StoreError>;

    fn get(&self, id: &str) -> Result<Option<TaskRun>, StoreError>;

    /// Runs of one tenant, in insertion order.
    fn list(&self, tenant: &str) -> Result<Vec<TaskRun>, StoreError>;

    /// Every run, in insertion order.
    fn list_all(&self) -> Result<Vec<TaskRun>, StoreError>;

    /// Apply `mutate` to each of `ids` atomically per task.
    ///
    /// If any id is unknown nothing is changed and `NotFound` is returned.
    fn apply(&self, ids: &[String], mutate: Mutation<'_>) -> Result<Vec<Transition>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, TaskRun>,
    order: Vec<String>,
    by_hash: HashMap<(String, String), String>,
}

/// Keeps runs in memory; one lock guards every read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunStore for MemoryRunStore {
    fn insert_unique(&self, run: TaskRun) -> Result<(TaskRun, bool), StoreError> {
        let mut inner = self.inner();
        let hash_key = (run.tenant.clone(), run.spec_hash.clone());

        if let Some(existing_id) = inner.by_hash.get(&hash_key) {
            if let Some(existing) = inner.runs.get(existing_id) {
                debug!(task = %existing.id, spec_hash = %run.spec_hash, "spec hash already stored");
                return Ok((existing.clone(), false));
            }
        }
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateId(run.id));
        }

        inner.by_hash.insert(hash_key, run.id.clone());
        inner.order.push(run.id.clone());
        inner.runs.insert(run.id.clone(), run.clone());
        info!(task = %run.id, tenant = %run.tenant, "stored new task run");
        Ok((run, true))
    }

    fn get(&self, id: &str) -> Result<Option<TaskRun>, StoreError> {
        Ok(self.inner().runs.get(id).cloned())
    }

    fn list(&self, tenant: &str) -> Result<Vec<TaskRun>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|run| run.tenant == tenant)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> Result<Vec<TaskRun>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .cloned()
            .collect())
    }

    fn apply(&self, ids: &[String], mutate: Mutation<'_>) -> Result<Vec<Transition>, StoreError> {
        let mut inner = self.inner();
        if let Some(missing) = ids.iter().find(|id| !inner.runs.contains_key(*id)) {
            return Err(StoreError::NotFound(missing.clone()));
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(current) = inner.runs.get(id) else {
                continue;
            };
            let mut draft = current.clone();
            match mutate(&mut draft) {
                Ok(()) => {
                    inner.runs.insert(id.clone(), draft.clone());
                    out.push(Transition::Applied(draft));
                }
                Err(reason) => out.push(Transition::Rejected {
                    id: id.clone(),
                    reason,
                }),
            }
        }
        Ok(out)
    }
}
