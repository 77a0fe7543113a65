//! A gateway wired to in-memory backends, plus workers that share its queue.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use workdag::integrity::TaskChainer;
use workdag::queue::{InMemoryQueue, Queue, keys};
use workdag::scheduler::{Gateway, MemoryRunStore};
use workdag::task::{Payload, Submission, Task, TaskRun};
use workdag::types::TaskStatus;
use workdag::worker::{CircuitBreaker, HandlerRegistry, SingleTaskWorker, WorkerConfig};

pub const TENANT: &str = "t1";

/// Object payload from a `json!` literal; anything else becomes empty.
pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

/// Worker settings with short waits, suitable for tests.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        pools: vec!["default".to_string()],
        capabilities: BTreeSet::new(),
        idle_exit: Duration::from_millis(300),
        task_timeout: Duration::from_secs(2),
        pool_rescan: Duration::from_millis(20),
    }
}

pub struct Harness {
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<MemoryRunStore>,
    pub gateway: Gateway,
    pub breaker: Arc<Mutex<CircuitBreaker>>,
}

impl Harness {
    pub fn new() -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MemoryRunStore::new());
        let gateway = Gateway::new(
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::clone(&store) as _,
            TaskChainer::new(),
        );
        Self {
            queue,
            store,
            gateway,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(3, Duration::from_secs(30)))),
        }
    }

    pub fn dyn_queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue) as Arc<dyn Queue>
    }

    /// Submit under [`TENANT`]; panics on rejection.
    pub async fn submit(&self, submission: Submission) -> TaskRun {
        self.gateway
            .submit(TENANT, submission)
            .await
            .expect("submission rejected")
            .run
    }

    pub fn status(&self, id: &str) -> TaskStatus {
        self.gateway.get(id).expect("unknown run").status
    }

    pub fn run(&self, id: &str) -> TaskRun {
        self.gateway.get(id).expect("unknown run")
    }

    /// Ids of the tasks waiting on the `default|` ready list, in order.
    pub async fn ready_ids(&self) -> Vec<String> {
        self.ready_tasks("default|")
            .await
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    pub async fn ready_tasks(&self, pool_key: &str) -> Vec<Task> {
        self.queue
            .range(&keys::ready(pool_key), 0, -1)
            .await
            .expect("range failed")
            .iter()
            .filter_map(|raw| Task::from_json(raw).ok())
            .collect()
    }

    /// A worker on this harness's queue and breaker.
    pub fn worker(&self, registry: HandlerRegistry) -> SingleTaskWorker {
        self.worker_with(registry, fast_worker_config())
    }

    pub fn worker_with(&self, registry: HandlerRegistry, config: WorkerConfig) -> SingleTaskWorker {
        SingleTaskWorker::new(
            self.dyn_queue(),
            Arc::new(registry),
            Arc::clone(&self.breaker),
            config,
        )
    }

    /// Handle every result already reported.
    pub async fn drain_results(&self) -> usize {
        self.gateway
            .process_results(Duration::ZERO)
            .await
            .expect("result processing failed")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
