// src/spawner/mod.rs

//! Warm-pool spawner.
//!
//! On every poll tick the spawner:
//! 1. reaps workers that exited,
//! 2. launches workers until `warm_pool_size` of them are idle (never more
//!    than `max_workers` alive),
//! 3. requeues orphaned in-flight tasks,
//! 4. updates the live-worker and queue-depth gauges.
//!
//! Workers are short-lived tokio tasks running [`SingleTaskWorker::run_once`].
//! They share one circuit breaker, which stays local to this process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::queue::Queue;
use crate::task::Task;
use crate::types::TaskKind;
use crate::worker::{CircuitBreaker, HandlerRegistry, SingleTaskWorker, WorkerConfig, WorkerExit};

/// Floor applied to `poll_interval`; a zero period would stall the ticker.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Idle workers to keep ready.
    pub warm_pool_size: usize,
    /// Upper bound on live workers (idle + busy).
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// In-flight items older than this are presumed orphaned.
    pub orphan_idle_threshold: Duration,
    /// How many pending items to inspect for the queue-depth gauge.
    pub pending_scan_limit: usize,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            warm_pool_size: 2,
            max_workers: 8,
            poll_interval: Duration::from_millis(500),
            orphan_idle_threshold: Duration::from_secs(600),
            pending_scan_limit: 1000,
        }
    }
}

/// What one [`WarmPoolSpawner::cycle`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reaped: usize,
    pub launched: usize,
    pub requeued: usize,
    pub live: usize,
    pub idle: usize,
    pub pending: usize,
}

struct Slot {
    id: String,
    busy: Arc<AtomicBool>,
    handle: JoinHandle<WorkerExit>,
}

pub struct WarmPoolSpawner {
    queue: Arc<dyn Queue>,
    registry: Arc<HandlerRegistry>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    metrics: Metrics,
    worker_config: WorkerConfig,
    config: SpawnerConfig,
    slots: Vec<Slot>,
}

impl WarmPoolSpawner {
    pub fn new(
        queue: Arc<dyn Queue>,
        registry: Arc<HandlerRegistry>,
        breaker: CircuitBreaker,
        metrics: Metrics,
        worker_config: WorkerConfig,
        config: SpawnerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            breaker: Arc::new(Mutex::new(breaker)),
            metrics,
            worker_config,
            config,
            slots: Vec::new(),
        }
    }

    /// The breaker shared by every worker this spawner launches.
    pub fn breaker(&self) -> Arc<Mutex<CircuitBreaker>> {
        Arc::clone(&self.breaker)
    }

    pub fn live_workers(&self) -> usize {
        self.slots.len()
    }

    /// One reconciliation pass. Queue failures are logged, never fatal.
    pub async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport {
            reaped: self.reap().await,
            ..CycleReport::default()
        };

        let mut idle = self.idle_count();
        while idle < self.config.warm_pool_size && self.slots.len() < self.config.max_workers {
            self.launch();
            idle += 1;
            report.launched += 1;
        }

        report.requeued = match self
            .queue
            .requeue_orphans(self.config.orphan_idle_threshold)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "orphan requeue failed");
                0
            }
        };

        report.live = self.slots.len();
        report.idle = self.idle_count();
        report.pending = self.update_gauges().await;
        debug!(?report, "spawner cycle");
        report
    }

    /// Tick until `shutdown` flips to `true` (or its sender goes away), then
    /// stop launching, cancel idle workers and wait for busy ones.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            warm_pool_size = self.config.warm_pool_size,
            max_workers = self.config.max_workers,
            poll_interval = ?self.config.poll_interval,
            "warm-pool spawner started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel idle workers and wait for busy ones to report.
    ///
    /// A worker cancelled between dequeue and flagging itself busy leaves
    /// its task in flight; the next orphan requeue returns it to the queue.
    pub async fn shutdown(mut self) {
        info!(live = self.slots.len(), "spawner shutting down");
        let slots = std::mem::take(&mut self.slots);
        let (busy, idle): (Vec<Slot>, Vec<Slot>) = slots
            .into_iter()
            .partition(|s| s.busy.load(Ordering::SeqCst));

        for slot in &idle {
            slot.handle.abort();
        }
        for slot in busy {
            match slot.handle.await {
                Ok(exit) => debug!(worker = %slot.id, reason = exit.reason(), "busy worker finished"),
                Err(e) => warn!(worker = %slot.id, error = %e, "busy worker failed"),
            }
        }
        self.metrics.set_live_workers(0);
        info!("spawner stopped");
    }

    fn idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.busy.load(Ordering::SeqCst))
            .count()
    }

    fn launch(&mut self) {
        let busy = Arc::new(AtomicBool::new(false));
        let worker = SingleTaskWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.breaker),
            self.worker_config.clone(),
        )
        .with_metrics(self.metrics.clone())
        .with_busy_flag(Arc::clone(&busy));

        let id = worker.id().to_string();
        debug!(worker = %id, "launching worker");
        let handle = tokio::spawn(async move { worker.run_once().await });
        self.slots.push(Slot { id, busy, handle });
    }

    async fn reap(&mut self) -> usize {
        let (done, alive): (Vec<Slot>, Vec<Slot>) = std::mem::take(&mut self.slots)
            .into_iter()
            .partition(|s| s.handle.is_finished());
        self.slots = alive;

        let reaped = done.len();
        for slot in done {
            match slot.handle.await {
                Ok(exit) => debug!(worker = %slot.id, reason = exit.reason(), "reaped worker"),
                Err(e) => warn!(worker = %slot.id, error = %e, "worker task failed"),
            }
        }
        reaped
    }

    /// Set the gauges; returns the number of pending items seen.
    async fn update_gauges(&self) -> usize {
        self.metrics.set_live_workers(self.slots.len());

        let pending = match self
            .queue
            .list_pending_tasks(self.config.pending_scan_limit)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not read pending tasks");
                return 0;
            }
        };

        let mut by_kind: BTreeMap<TaskKind, usize> =
            TaskKind::ALL.iter().map(|k| (*k, 0)).collect();
        for item in &pending {
            if let Ok(task) = Task::from_json(&item.item) {
                *by_kind.entry(task.kind).or_default() += 1;
            }
        }
        for (kind, n) in by_kind {
            self.metrics.set_queue_pending(kind.as_str(), n);
        }
        pending.len()
    }
}
