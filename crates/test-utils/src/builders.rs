#![allow(dead_code)]

use std::path::Path;

use serde_json::Value;
use workdag::config::{ConfigFile, RawConfigFile, TaskConfig};
use workdag::task::{Payload, Submission};
use workdag::types::TaskKind;

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from the section defaults with short worker and spawner timings.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.worker.idle_exit = "300ms".to_string();
        config.worker.task_timeout = "5s".to_string();
        config.spawner.poll_interval = "20ms".to_string();
        Self { config }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn manifest_dir(mut self, dir: &Path) -> Self {
        self.config.manifest.dir = dir.to_path_buf();
        self
    }

    pub fn tenant(mut self, tenant: &str) -> Self {
        self.config.manifest.tenant = tenant.to_string();
        self
    }

    pub fn capabilities(mut self, caps: &[&str]) -> Self {
        self.config.worker.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn task_timeout(mut self, duration: &str) -> Self {
        self.config.worker.task_timeout = duration.to_string();
        self
    }

    pub fn fail_max(mut self, n: u32) -> Self {
        self.config.breaker.fail_max = n;
        self
    }

    pub fn warm_pool(mut self, warm: usize, max: usize) -> Self {
        self.config.spawner.warm_pool_size = warm;
        self.config.spawner.max_workers = max;
        self
    }

    pub fn queue_address(mut self, address: &str) -> Self {
        self.config.queue.address = address.to_string();
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                kind: TaskKind::Execute,
                cmd: Some(cmd.to_string()),
                after: vec![],
                requires: vec![],
                edge_pred: None,
                payload: Payload::new(),
            },
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.task.kind = kind;
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn requires(mut self, label: &str) -> Self {
        self.task.requires.push(label.to_string());
        self
    }

    pub fn edge_pred(mut self, pred: &str) -> Self {
        self.task.edge_pred = Some(pred.to_string());
        self
    }

    pub fn payload_field(mut self, key: &str, value: Value) -> Self {
        self.task.payload.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Builder for gateway `Submission`s with explicit ids.
pub struct SubmissionBuilder {
    submission: Submission,
}

impl SubmissionBuilder {
    /// An `execute` submission with id `id` and an `{"n": id}` payload, so
    /// different ids never collide on `spec_hash`.
    pub fn new(id: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("n".to_string(), Value::String(id.to_string()));
        Self {
            submission: Submission::new(TaskKind::Execute, payload).with_id(id),
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.submission.kind = kind;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.submission.payload = payload;
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.submission = self.submission.after(dep);
        self
    }

    pub fn requires(mut self, label: &str) -> Self {
        self.submission = self.submission.requires(label);
        self
    }

    pub fn edge_pred(mut self, pred: &str) -> Self {
        self.submission = self.submission.edge_pred(pred);
        self
    }

    pub fn pool(mut self, pool: &str) -> Self {
        self.submission = self.submission.pool(pool);
        self
    }

    pub fn build(self) -> Submission {
        self.submission
    }
}
