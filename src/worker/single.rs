// src/worker/single.rs

//! Single-task worker.
//!
//! A worker registers its presence, waits (bounded by its idle-exit
//! deadline) for one task on the pool keys it can serve, executes it and
//! reports the result, then exits.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::metrics::Metrics;
use crate::queue::{Delivery, Queue, keys};
use crate::scheduler::worker_supports;
use crate::task::{PoolKey, Task, TaskResult, TaskRun};
use crate::types::{ResultStatus, TaskStatus};
use crate::worker::breaker::{Admission, CircuitBreaker};
use crate::worker::handler::{HandlerError, HandlerRegistry, Outcome};
use crate::worker::presence;

/// Reason string attached to results synthesized while a breaker is open.
pub const CIRCUIT_OPEN_REASON: &str = "circuit open";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool namespaces this worker serves (the part before `|`).
    pub pools: Vec<String>,
    /// Capability labels this worker advertises.
    pub capabilities: BTreeSet<String>,
    /// Exit when no task arrives within this long.
    pub idle_exit: Duration,
    /// Per-task execution limit.
    pub task_timeout: Duration,
    /// How often the set of known pool keys is re-read while waiting.
    pub pool_rescan: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pools: vec!["default".to_string()],
            capabilities: BTreeSet::new(),
            idle_exit: Duration::from_secs(5),
            task_timeout: Duration::from_secs(300),
            pool_rescan: Duration::from_millis(250),
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Executed one task and reported the result.
    Completed(ResultStatus),
    /// No task arrived before the idle-exit deadline.
    IdleTimeout,
    /// The delivered task's run is no longer `running`; dropped unexecuted.
    Discarded,
    /// The delivered item was not a task.
    Malformed,
    /// The queue backend failed.
    QueueError,
}

impl WorkerExit {
    pub fn reason(&self) -> &'static str {
        match self {
            WorkerExit::Completed(_) => "completed",
            WorkerExit::IdleTimeout => "idle_timeout",
            WorkerExit::Discarded => "discarded",
            WorkerExit::Malformed => "malformed",
            WorkerExit::QueueError => "queue_error",
        }
    }
}

pub struct SingleTaskWorker {
    id: String,
    queue: Arc<dyn Queue>,
    registry: Arc<HandlerRegistry>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    metrics: Option<Metrics>,
    config: WorkerConfig,
    busy: Arc<AtomicBool>,
}

impl SingleTaskWorker {
    pub fn new(
        queue: Arc<dyn Queue>,
        registry: Arc<HandlerRegistry>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            queue,
            registry,
            breaker,
            metrics: None,
            config,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a flag that flips to `true` once this worker holds a task.
    pub fn with_busy_flag(mut self, busy: Arc<AtomicBool>) -> Self {
        self.busy = busy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serve at most one task, then exit.
    pub async fn run_once(&self) -> WorkerExit {
        let exit = match self.serve().await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "worker stopped on queue error");
                WorkerExit::QueueError
            }
        };

        if let Err(e) = presence::deregister(self.queue.as_ref(), &self.id).await {
            debug!(worker = %self.id, error = %e, "failed to deregister worker");
        }
        if let Some(m) = &self.metrics {
            m.worker_exited(exit.reason());
        }
        info!(worker = %self.id, reason = exit.reason(), "worker exited");
        exit
    }

    async fn serve(&self) -> Result<WorkerExit> {
        presence::register(
            self.queue.as_ref(),
            &self.id,
            &self.config.pools,
            &self.config.capabilities,
        )
        .await?;

        let Some(delivery) = self.wait_for_delivery().await? else {
            return Ok(WorkerExit::IdleTimeout);
        };
        self.busy.store(true, Ordering::SeqCst);

        let task = match Task::from_json(&delivery.item) {
            Ok(task) => task,
            Err(e) => {
                warn!(worker = %self.id, pool = %delivery.pool, error = %e, "malformed queue item dropped");
                self.queue.ack(&delivery).await?;
                return Ok(WorkerExit::Malformed);
            }
        };

        if !self.still_wanted(&task).await? {
            info!(worker = %self.id, task = %task.id, "run no longer running; dropping delivery");
            self.queue.ack(&delivery).await?;
            return Ok(WorkerExit::Discarded);
        }

        let started = Instant::now();
        let result = self.execute(&task).await;
        if let Some(m) = &self.metrics {
            m.observe_runtime(started.elapsed().as_secs_f64());
            m.task_completed(result.status);
        }

        self.report(&delivery, &result).await?;
        Ok(WorkerExit::Completed(result.status))
    }

    /// Block on the matching pool keys until a delivery or the idle-exit
    /// deadline. Pool keys created while waiting are picked up on the next
    /// rescan.
    async fn wait_for_delivery(&self) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + self.config.idle_exit;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.pool_rescan);

            let pools = self.matching_pools().await?;
            if pools.is_empty() {
                tokio::time::sleep(wait).await;
                continue;
            }
            if let Some(delivery) = self.queue.dequeue(&pools, wait).await? {
                debug!(worker = %self.id, pool = %delivery.pool, "received delivery");
                return Ok(Some(delivery));
            }
            presence::heartbeat(self.queue.as_ref(), &self.id).await?;
        }
    }

    /// Known pool keys in this worker's namespaces whose labels it covers.
    async fn matching_pools(&self) -> Result<Vec<String>> {
        let members = self.queue.set_members(keys::POOLS).await?;
        Ok(members
            .into_iter()
            .filter(|raw| match raw.parse::<PoolKey>() {
                Ok(key) => {
                    self.config.pools.contains(&key.pool)
                        && worker_supports(&self.config.capabilities, &key.labels)
                }
                Err(_) => false,
            })
            .collect())
    }

    /// Compare the delivery against the gateway's snapshot of the run.
    ///
    /// A missing or unreadable snapshot does not block execution.
    async fn still_wanted(&self, task: &Task) -> Result<bool> {
        let Some(blob) = self.queue.hash_get(&keys::task(&task.id), "blob").await? else {
            return Ok(true);
        };
        match serde_json::from_str::<TaskRun>(&blob) {
            Ok(run) => Ok(run.status == TaskStatus::Running && run.attempts == task.attempts),
            Err(e) => {
                debug!(task = %task.id, error = %e, "unreadable run snapshot; executing anyway");
                Ok(true)
            }
        }
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the handler for `task`, folding every failure into the result.
    async fn execute(&self, task: &Task) -> TaskResult {
        let key = task.kind.as_str();

        let admission = self.breaker().admit(key);
        if let Admission::CircuitOpen { retry_after } = admission {
            warn!(task = %task.id, kind = key, ?retry_after, "circuit open; handler not invoked");
            return TaskResult::error(task, CIRCUIT_OPEN_REASON);
        }

        let Some(handler) = self.registry.get(task.kind) else {
            warn!(task = %task.id, kind = key, "no handler registered");
            return TaskResult::error(task, HandlerError::NoHandler(task.kind).to_string());
        };

        info!(worker = %self.id, task = %task.id, kind = key, attempts = task.attempts, "executing task");
        let join = tokio::spawn(handler.handle(task.clone()));
        let abort = join.abort_handle();

        let outcome = match tokio::time::timeout(self.config.task_timeout, join).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(join_err)) => Err(HandlerError::Failed(join_err.to_string())),
            Err(_) => {
                abort.abort();
                Err(HandlerError::Timeout(self.config.task_timeout))
            }
        };

        match outcome {
            Ok(Outcome::Done(data)) => {
                self.breaker().record_success(key);
                TaskResult::ok(task, data)
            }
            Ok(Outcome::Skipped) => {
                self.breaker().record_success(key);
                TaskResult::skip(task)
            }
            Err(e) => {
                warn!(task = %task.id, kind = key, error = %e, "task failed");
                self.breaker().record_failure(key);
                TaskResult::error(task, e.to_string())
            }
        }
    }

    /// Push the result, then clear the in-flight marker.
    async fn report(&self, delivery: &Delivery, result: &TaskResult) -> Result<()> {
        self.queue.push_right(keys::RESULTS, result.to_json()?).await?;
        if !self.queue.ack(delivery).await? {
            debug!(task = %result.task_id, "delivery was already reclaimed as an orphan");
        }
        info!(task = %result.task_id, status = %result.status, "result reported");
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
