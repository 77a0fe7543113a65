// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::{Record, topological_sort};
use crate::errors::Result;
use crate::spawner::SpawnerConfig;
use crate::task::{Payload, Submission};
use crate::types::TaskKind;
use crate::worker::{CircuitBreaker, WorkerConfig};

/// Configuration exactly as deserialized from TOML.
///
/// ```toml
/// [queue]
/// address = "memory://"
///
/// [worker]
/// task_timeout = "5m"
/// capabilities = ["shell"]
///
/// [task.build]
/// cmd = "cargo build"
///
/// [task.test]
/// cmd = "cargo test"
/// after = ["build"]
/// ```
///
/// Every section is optional. Durations are still strings here; they are
/// parsed while converting into [`ConfigFile`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub queue: RawQueueSection,

    #[serde(default)]
    pub worker: RawWorkerSection,

    #[serde(default)]
    pub breaker: RawBreakerSection,

    #[serde(default)]
    pub spawner: RawSpawnerSection,

    #[serde(default)]
    pub manifest: ManifestSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQueueSection {
    #[serde(default = "default_queue_address")]
    pub address: String,

    /// Lifetime of the per-task status snapshots.
    #[serde(default = "default_task_ttl")]
    pub task_ttl: String,
}

fn default_queue_address() -> String {
    "memory://".to_string()
}

fn default_task_ttl() -> String {
    "24h".to_string()
}

impl Default for RawQueueSection {
    fn default() -> Self {
        Self {
            address: default_queue_address(),
            task_ttl: default_task_ttl(),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkerSection {
    #[serde(default = "default_idle_exit")]
    pub idle_exit: String,

    #[serde(default = "default_task_timeout")]
    pub task_timeout: String,

    #[serde(default = "default_pools")]
    pub pools: Vec<String>,

    /// Capability labels advertised by locally spawned workers.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

fn default_idle_exit() -> String {
    "5s".to_string()
}

fn default_task_timeout() -> String {
    "5m".to_string()
}

fn default_pools() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_capabilities() -> Vec<String> {
    vec!["shell".to_string()]
}

impl Default for RawWorkerSection {
    fn default() -> Self {
        Self {
            idle_exit: default_idle_exit(),
            task_timeout: default_task_timeout(),
            pools: default_pools(),
            capabilities: default_capabilities(),
        }
    }
}

/// `[breaker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBreakerSection {
    #[serde(default = "default_fail_max")]
    pub fail_max: u32,

    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: String,
}

fn default_fail_max() -> u32 {
    3
}

fn default_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for RawBreakerSection {
    fn default() -> Self {
        Self {
            fail_max: default_fail_max(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

/// `[spawner]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSpawnerSection {
    #[serde(default = "default_warm_pool_size")]
    pub warm_pool_size: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_orphan_idle_threshold")]
    pub orphan_idle_threshold: String,
}

fn default_warm_pool_size() -> usize {
    2
}

fn default_max_workers() -> usize {
    8
}

fn default_poll_interval() -> String {
    "500ms".to_string()
}

fn default_orphan_idle_threshold() -> String {
    "10m".to_string()
}

impl Default for RawSpawnerSection {
    fn default() -> Self {
        Self {
            warm_pool_size: default_warm_pool_size(),
            max_workers: default_max_workers(),
            poll_interval: default_poll_interval(),
            orphan_idle_threshold: default_orphan_idle_threshold(),
        }
    }
}

/// `[manifest]` section. Needs no parsing, so the raw and validated forms
/// are the same type.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ManifestSection {
    /// Directory holding the manifest files and the chain head.
    #[serde(default = "default_manifest_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_manifest_name")]
    pub name: String,

    /// Tenant every configured task is submitted under.
    #[serde(default = "default_tenant")]
    pub tenant: String,
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from(".workdag")
}

fn default_manifest_name() -> String {
    "manifest".to_string()
}

fn default_tenant() -> String {
    "local".to_string()
}

impl Default for ManifestSection {
    fn default() -> Self {
        Self {
            dir: default_manifest_dir(),
            name: default_manifest_name(),
            tenant: default_tenant(),
        }
    }
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskConfig {
    #[serde(default = "default_kind")]
    pub kind: TaskKind,

    /// Shell command; copied into the payload as `cmd`.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Names of tasks that must succeed first.
    #[serde(default)]
    pub after: Vec<String>,

    /// Capability labels a worker must advertise.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Predicate over the dependencies' results gating this task.
    #[serde(default)]
    pub edge_pred: Option<String>,

    /// Extra payload fields.
    #[serde(default)]
    pub payload: Payload,
}

fn default_kind() -> TaskKind {
    TaskKind::Execute
}

impl TaskConfig {
    /// Payload submitted for this task: `payload` plus `cmd` when set.
    pub fn effective_payload(&self) -> Payload {
        let mut payload = self.payload.clone();
        if let Some(cmd) = &self.cmd {
            payload.insert("cmd".to_string(), cmd.clone().into());
        }
        payload
    }
}

/// Validated configuration with durations parsed.
///
/// Only constructed through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub queue: QueueSection,
    pub worker: WorkerSection,
    pub breaker: BreakerSection,
    pub spawner: SpawnerSection,
    pub manifest: ManifestSection,
    pub task: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSection {
    pub address: String,
    pub task_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSection {
    pub idle_exit: Duration,
    pub task_timeout: Duration,
    pub pools: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSection {
    pub fail_max: u32,
    pub reset_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerSection {
    pub warm_pool_size: usize,
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub orphan_idle_threshold: Duration,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        queue: QueueSection,
        worker: WorkerSection,
        breaker: BreakerSection,
        spawner: SpawnerSection,
        manifest: ManifestSection,
        task: BTreeMap<String, TaskConfig>,
    ) -> Self {
        Self {
            queue,
            worker,
            breaker,
            spawner,
            manifest,
            task,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            pools: self.worker.pools.clone(),
            capabilities: self.worker.capabilities.iter().cloned().collect(),
            idle_exit: self.worker.idle_exit,
            task_timeout: self.worker.task_timeout,
            ..WorkerConfig::default()
        }
    }

    pub fn spawner_config(&self) -> SpawnerConfig {
        SpawnerConfig {
            warm_pool_size: self.spawner.warm_pool_size,
            max_workers: self.spawner.max_workers,
            poll_interval: self.spawner.poll_interval,
            orphan_idle_threshold: self.spawner.orphan_idle_threshold,
            ..SpawnerConfig::default()
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.breaker.fail_max, self.breaker.reset_timeout)
    }

    /// One graph record per task, in name order.
    pub fn task_records(&self) -> Vec<Record> {
        self.task
            .iter()
            .map(|(name, task)| Record {
                id: name.clone(),
                deps: task.after.clone(),
            })
            .collect()
    }

    /// Task names in submission order: dependencies first, ties by name.
    pub fn task_order(&self) -> Result<Vec<String>> {
        let records = self.task_records();
        let order = topological_sort(&records)?;
        Ok(order.into_iter().map(|r| r.id.clone()).collect())
    }

    /// One submission per task, in [`ConfigFile::task_order`]. The task name
    /// becomes the task id and is added to the payload as `name`, so two
    /// tasks running the same command stay distinct. Every task lands in
    /// the first configured pool.
    pub fn submissions(&self) -> Result<Vec<Submission>> {
        let pool = self
            .worker
            .pools
            .first()
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let mut out = Vec::with_capacity(self.task.len());
        for name in self.task_order()? {
            let Some(task) = self.task.get(&name) else {
                continue;
            };
            let mut payload = task.effective_payload();
            payload.insert("name".to_string(), name.clone().into());
            let mut submission = Submission::new(task.kind, payload)
                .with_id(name.clone())
                .pool(pool.clone());
            for label in &task.requires {
                submission = submission.requires(label.clone());
            }
            for dep in &task.after {
                submission = submission.after(dep.clone());
            }
            if let Some(pred) = &task.edge_pred {
                submission = submission.edge_pred(pred.clone());
            }
            out.push(submission);
        }
        Ok(out)
    }
}
