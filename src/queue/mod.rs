// src/queue/mod.rs

//! Abstract queue used for task delivery, result channels, worker
//! bookkeeping and orphan detection.
//!
//! The queue knows nothing about tasks: items are opaque strings (JSON in
//! practice). The gateway, the workers and the spawner only ever talk to an
//! `Arc<dyn Queue>`, so tests and local runs use [`InMemoryQueue`] while a
//! networked backend can slot in behind the same trait.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use memory::InMemoryQueue;

/// Well-known keys.
pub mod keys {
    /// Set of every pool key that has ever received a task.
    pub const POOLS: &str = "pools";
    /// List of serialized `TaskResult`s waiting for the gateway.
    pub const RESULTS: &str = "results";
    /// List of published task events.
    pub const EVENTS: &str = "events";
    /// Set of worker ids that registered presence.
    pub const WORKERS: &str = "workers";

    pub fn ready(pool: &str) -> String {
        format!("ready:{pool}")
    }

    pub fn worker(id: &str) -> String {
        format!("worker:{id}")
    }

    pub fn task(id: &str) -> String {
        format!("task:{id}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The backend could not be reached. Callers may retry.
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported queue address '{0}'")]
    UnsupportedAddress(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// An item handed to exactly one consumer by [`Queue::dequeue`].
///
/// The item stays in the in-flight table until [`Queue::ack`] is called
/// with this delivery, or until [`Queue::requeue_orphans`] reclaims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub pool: String,
    pub item: String,
    pub token: u64,
}

/// One ready item, as reported by [`Queue::list_pending_tasks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingItem {
    pub pool: String,
    pub item: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Append `item` to the ready list of `pool` and record the pool key.
    async fn enqueue(&self, pool: &str, item: String) -> QueueResult<()>;

    /// Blocking pop across `pools`, checked in argument order.
    ///
    /// Returns `None` once `timeout` elapses without any item.
    async fn dequeue(&self, pools: &[String], timeout: Duration) -> QueueResult<Option<Delivery>>;

    /// Clear the in-flight marker of `delivery`.
    ///
    /// Returns `false` when the marker is gone already (reclaimed as orphan
    /// or acked twice).
    async fn ack(&self, delivery: &Delivery) -> QueueResult<bool>;

    async fn push_right(&self, key: &str, item: String) -> QueueResult<()>;

    async fn pop_left(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>>;

    /// Inclusive range; negative indices count from the end (`-1` = last).
    async fn range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>>;

    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool>;

    async fn set_members(&self, key: &str) -> QueueResult<BTreeSet<String>>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> QueueResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> QueueResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> QueueResult<BTreeMap<String, String>>;

    /// Attach a time-to-live to `key`. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool>;

    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Ready items across all pools: pools in sorted order, FIFO within a
    /// pool, at most `limit` entries.
    async fn list_pending_tasks(&self, limit: usize) -> QueueResult<Vec<PendingItem>>;

    /// Move every in-flight item claimed at least `idle_threshold` ago back
    /// onto the head of its ready list. Returns how many items moved.
    ///
    /// Each call is atomic with respect to other queue operations, so
    /// repeated or concurrent calls never move the same item twice.
    async fn requeue_orphans(&self, idle_threshold: Duration) -> QueueResult<usize>;
}

/// Open a queue from a backend address.
///
/// Only the in-process backend (`memory://`) ships with this crate.
pub fn open_queue(address: &str) -> QueueResult<Arc<dyn Queue>> {
    match address.trim() {
        "memory://" | "memory" => Ok(Arc::new(InMemoryQueue::new())),
        other => Err(QueueError::UnsupportedAddress(other.to_string())),
    }
}
