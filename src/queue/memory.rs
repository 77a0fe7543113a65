// src/queue/memory.rs

//! In-process [`Queue`] backend.
//!
//! All state lives behind one `std::sync::Mutex` that is never held across
//! an `.await`. Blocking pops park on a `tokio::sync::Notify` that every
//! push wakes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Delivery, PendingItem, Queue, QueueError, QueueResult, keys};

#[derive(Debug)]
struct InFlight {
    pool: String,
    item: String,
    claimed_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    expiry: HashMap<String, Instant>,
    in_flight: BTreeMap<u64, InFlight>,
    next_token: u64,
}

impl State {
    /// Drop `key` everywhere if its TTL has passed.
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .expiry
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.expiry.remove(key);
            self.lists.remove(key);
            self.sets.remove(key);
            self.hashes.remove(key);
        }
    }

    fn key_exists(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.lists.get(key).is_some_and(|l| !l.is_empty())
            || self.sets.get(key).is_some_and(|s| !s.is_empty())
            || self.hashes.get(key).is_some_and(|h| !h.is_empty())
    }

    fn pop_front(&mut self, key: &str) -> Option<String> {
        self.purge_if_expired(key);
        self.lists.get_mut(key).and_then(VecDeque::pop_front)
    }

    fn claim(&mut self, pools: &[String]) -> Option<Delivery> {
        for pool in pools {
            if let Some(item) = self.pop_front(&keys::ready(pool)) {
                self.next_token += 1;
                let token = self.next_token;
                self.in_flight.insert(
                    token,
                    InFlight {
                        pool: pool.clone(),
                        item: item.clone(),
                        claimed_at: Instant::now(),
                    },
                );
                return Some(Delivery {
                    pool: pool.clone(),
                    item,
                    token,
                });
            }
        }
        None
    }
}

/// Mutex-guarded queue shared by every actor of one process.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    available: AtomicBool,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage: while unavailable every call fails with
    /// [`QueueError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "in-memory queue availability changed");
        self.notify.notify_waiters();
    }

    /// Number of items currently claimed but not acked.
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("in-memory queue is offline".to_string()))
        }
    }

    /// Run `attempt` until it yields a value or `timeout` elapses.
    ///
    /// The notification is armed before each attempt, so a push landing
    /// between the attempt and the wait is never missed.
    async fn block_on<T>(
        &self,
        timeout: Duration,
        mut attempt: impl FnMut(&mut State) -> Option<T>,
    ) -> QueueResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let found = {
                let mut state = self.state();
                attempt(&mut state)
            };
            if let Some(value) = found {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, pool: &str, item: String) -> QueueResult<()> {
        self.check_available()?;
        {
            let mut state = self.state();
            let key = keys::ready(pool);
            state.purge_if_expired(&key);
            state.lists.entry(key).or_default().push_back(item);
            state
                .sets
                .entry(keys::POOLS.to_string())
                .or_default()
                .insert(pool.to_string());
        }
        debug!(pool, "enqueued item");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, pools: &[String], timeout: Duration) -> QueueResult<Option<Delivery>> {
        self.block_on(timeout, |state| state.claim(pools)).await
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        self.check_available()?;
        Ok(self.state().in_flight.remove(&delivery.token).is_some())
    }

    async fn push_right(&self, key: &str, item: String) -> QueueResult<()> {
        self.check_available()?;
        {
            let mut state = self.state();
            state.purge_if_expired(key);
            state.lists.entry(key.to_string()).or_default().push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_left(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>> {
        self.block_on(timeout, |state| state.pop_front(key)).await
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let norm = |i: i64| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        Ok(state
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn set_members(&self, key: &str) -> QueueResult<BTreeSet<String>> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        Ok(state.sets.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> QueueResult<Option<String>> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> QueueResult<BTreeMap<String, String>> {
        self.check_available()?;
        let mut state = self.state();
        state.purge_if_expired(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        self.check_available()?;
        let mut state = self.state();
        if !state.key_exists(key) {
            return Ok(false);
        }
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        self.check_available()?;
        Ok(self.state().key_exists(key))
    }

    async fn list_pending_tasks(&self, limit: usize) -> QueueResult<Vec<PendingItem>> {
        self.check_available()?;
        let mut state = self.state();
        let pools: Vec<String> = state
            .sets
            .get(keys::POOLS)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut out = Vec::new();
        for pool in pools {
            let key = keys::ready(&pool);
            state.purge_if_expired(&key);
            let Some(list) = state.lists.get(&key) else {
                continue;
            };
            for item in list {
                if out.len() >= limit {
                    return Ok(out);
                }
                out.push(PendingItem {
                    pool: pool.clone(),
                    item: item.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn requeue_orphans(&self, idle_threshold: Duration) -> QueueResult<usize> {
        self.check_available()?;
        let moved = {
            let mut state = self.state();
            let now = Instant::now();
            let stale: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, f)| now.duration_since(f.claimed_at) >= idle_threshold)
                .map(|(token, _)| *token)
                .collect();

            // Oldest claim first, each pushed to the head, so walk newest
            // first to keep the original order at the front of the list.
            for token in stale.iter().rev() {
                if let Some(entry) = state.in_flight.remove(token) {
                    state
                        .lists
                        .entry(keys::ready(&entry.pool))
                        .or_default()
                        .push_front(entry.item);
                }
            }
            stale.len()
        };

        if moved > 0 {
            info!(moved, ?idle_threshold, "requeued orphaned in-flight items");
            self.notify.notify_waiters();
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn dequeue_is_fifo_and_checks_pools_in_order() {
        let q = InMemoryQueue::new();
        q.enqueue("a|", "a1".into()).await.unwrap();
        q.enqueue("b|", "b1".into()).await.unwrap();
        q.enqueue("a|", "a2".into()).await.unwrap();

        let order = pools(&["b|", "a|"]);
        let first = q.dequeue(&order, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!((first.pool.as_str(), first.item.as_str()), ("b|", "b1"));
        let second = q.dequeue(&order, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.item, "a1");
        let third = q.dequeue(&order, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(third.item, "a2");
        assert!(q.dequeue(&order, Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let q = Arc::new(InMemoryQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue(&pools(&["p|"]), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue("p|", "late".into()).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.item, "late");
    }

    #[tokio::test]
    async fn ack_clears_in_flight_once() {
        let q = InMemoryQueue::new();
        q.enqueue("p|", "x".into()).await.unwrap();
        let d = q.dequeue(&pools(&["p|"]), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(q.in_flight_len(), 1);
        assert!(q.ack(&d).await.unwrap());
        assert!(!q.ack(&d).await.unwrap());
        assert_eq!(q.requeue_orphans(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn orphans_are_requeued_exactly_once() {
        let q = Arc::new(InMemoryQueue::new());
        for item in ["o1", "o2", "o3"] {
            q.enqueue("p|", item.into()).await.unwrap();
        }
        q.enqueue("p|", "fresh".into()).await.unwrap();
        for _ in 0..3 {
            q.dequeue(&pools(&["p|"]), Duration::ZERO).await.unwrap().unwrap();
        }

        // Not old enough yet.
        assert_eq!(q.requeue_orphans(Duration::from_secs(60)).await.unwrap(), 0);

        let a = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.requeue_orphans(Duration::ZERO).await })
        };
        let b = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.requeue_orphans(Duration::ZERO).await })
        };
        let total = a.await.unwrap().unwrap() + b.await.unwrap().unwrap();
        assert_eq!(total, 3);
        assert_eq!(q.requeue_orphans(Duration::ZERO).await.unwrap(), 0);

        let pending: Vec<String> = q
            .list_pending_tasks(10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.item)
            .collect();
        assert_eq!(pending, vec!["o1", "o2", "o3", "fresh"]);
    }

    #[tokio::test]
    async fn pending_tasks_are_sorted_by_pool_and_limited() {
        let q = InMemoryQueue::new();
        q.enqueue("z|", "z1".into()).await.unwrap();
        q.enqueue("a|", "a1".into()).await.unwrap();
        q.enqueue("a|", "a2".into()).await.unwrap();

        let all = q.list_pending_tasks(10).await.unwrap();
        let seen: Vec<(&str, &str)> = all.iter().map(|p| (p.pool.as_str(), p.item.as_str())).collect();
        assert_eq!(seen, vec![("a|", "a1"), ("a|", "a2"), ("z|", "z1")]);
        assert_eq!(q.list_pending_tasks(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn hashes_expire_lazily() {
        let q = InMemoryQueue::new();
        q.hash_set("task:t1", &[("status", "running".to_string())]).await.unwrap();
        assert!(q.expire("task:t1", Duration::from_millis(20)).await.unwrap());
        assert!(q.exists("task:t1").await.unwrap());
        assert_eq!(
            q.hash_get("task:t1", "status").await.unwrap().as_deref(),
            Some("running")
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!q.exists("task:t1").await.unwrap());
        assert!(q.hash_get_all("task:t1").await.unwrap().is_empty());
        assert!(!q.expire("task:missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn range_supports_negative_indices() {
        let q = InMemoryQueue::new();
        for i in 0..5 {
            q.push_right("l", i.to_string()).await.unwrap();
        }
        assert_eq!(q.range("l", 0, -1).await.unwrap().len(), 5);
        assert_eq!(q.range("l", -2, -1).await.unwrap(), vec!["3", "4"]);
        assert_eq!(q.range("l", 1, 2).await.unwrap(), vec!["1", "2"]);
        assert!(q.range("l", 4, 1).await.unwrap().is_empty());
        assert!(q.range("missing", 0, -1).await.unwrap().is_empty());
        assert_eq!(q.pop_left("l", Duration::ZERO).await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn outage_is_surfaced_not_swallowed() {
        let q = InMemoryQueue::new();
        q.set_available(false);
        let err = q.enqueue("p|", "x".into()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(q.dequeue(&pools(&["p|"]), Duration::ZERO).await.is_err());
        assert!(q.list_pending_tasks(1).await.is_err());

        q.set_available(true);
        q.enqueue("p|", "x".into()).await.unwrap();
    }

    #[tokio::test]
    async fn sets_track_membership() {
        let q = InMemoryQueue::new();
        assert!(q.set_add("workers", "w1").await.unwrap());
        assert!(!q.set_add("workers", "w1").await.unwrap());
        q.enqueue("gpu|cuda", "t".into()).await.unwrap();
        assert!(q.set_members(keys::POOLS).await.unwrap().contains("gpu|cuda"));
        assert!(q.set_remove("workers", "w1").await.unwrap());
        assert!(q.set_members("workers").await.unwrap().is_empty());
    }
}
