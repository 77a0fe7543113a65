// src/worker/presence.rs

//! Worker presence bookkeeping.
//!
//! A worker adds itself to the `workers` set and keeps a `worker:<id>` hash
//! alive with a short TTL. Anything reading presence treats a worker whose
//! hash has expired as gone.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::queue::{Queue, QueueResult, keys};

/// Lifetime of a presence entry without a heartbeat.
pub const PRESENCE_TTL: Duration = Duration::from_secs(15);

pub async fn register(
    queue: &dyn Queue,
    worker_id: &str,
    pools: &[String],
    capabilities: &BTreeSet<String>,
) -> QueueResult<()> {
    queue.set_add(keys::WORKERS, worker_id).await?;
    let key = keys::worker(worker_id);
    let now = Utc::now().to_rfc3339();
    queue
        .hash_set(
            &key,
            &[
                ("pools", pools.join(",")),
                (
                    "capabilities",
                    capabilities.iter().cloned().collect::<Vec<_>>().join(","),
                ),
                ("registered_at", now.clone()),
                ("heartbeat", now),
            ],
        )
        .await?;
    queue.expire(&key, PRESENCE_TTL).await?;
    debug!(worker = %worker_id, "worker registered");
    Ok(())
}

pub async fn heartbeat(queue: &dyn Queue, worker_id: &str) -> QueueResult<()> {
    let key = keys::worker(worker_id);
    queue
        .hash_set(&key, &[("heartbeat", Utc::now().to_rfc3339())])
        .await?;
    queue.expire(&key, PRESENCE_TTL).await?;
    Ok(())
}

pub async fn deregister(queue: &dyn Queue, worker_id: &str) -> QueueResult<()> {
    queue.set_remove(keys::WORKERS, worker_id).await?;
    queue.expire(&keys::worker(worker_id), Duration::ZERO).await?;
    debug!(worker = %worker_id, "worker deregistered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;

    #[tokio::test]
    async fn register_then_deregister() {
        let q = InMemoryQueue::new();
        let caps: BTreeSet<String> = ["shell".to_string()].into_iter().collect();
        register(&q, "w1", &["default".to_string()], &caps).await.unwrap();

        assert!(q.set_members(keys::WORKERS).await.unwrap().contains("w1"));
        assert_eq!(
            q.hash_get("worker:w1", "capabilities").await.unwrap().as_deref(),
            Some("shell")
        );
        heartbeat(&q, "w1").await.unwrap();

        deregister(&q, "w1").await.unwrap();
        assert!(!q.exists("worker:w1").await.unwrap());
        assert!(q.set_members(keys::WORKERS).await.unwrap().is_empty());
    }
}
