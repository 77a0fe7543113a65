// src/task/mod.rs

//! Task data model.
//!
//! - [`Task`] is the immutable unit of work that travels through the queue.
//! - [`TaskResult`] is produced exactly once per execution attempt.
//! - [`TaskRun`] is the gateway-owned persisted record (a superset of
//!   `Task` plus scheduling state).
//! - [`Submission`] is what a caller hands to the gateway.
//! - [`PoolKey`] names the ready list a task is delivered on.

pub mod canonical;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::dag::graph::DependencyRecord;
use crate::types::{ResultStatus, TaskKind, TaskStatus};

pub use canonical::{canonical_bytes, canonical_json, sha256_hex};

/// Opaque key/value map used for payloads and result data.
pub type Payload = Map<String, Value>;

/// Current wire schema of [`Task`] and [`TaskResult`].
pub const SCHEMA_VERSION: u32 = 1;

/// Immutable work description.
///
/// Retries never mutate a `Task`; the gateway derives a new value from the
/// run with an incremented `attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Payload,
    pub requires: BTreeSet<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl Task {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: ResultStatus,
    pub data: Payload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

impl TaskResult {
    pub fn ok(task: &Task, data: Payload) -> Self {
        Self::with_status(task, ResultStatus::Ok, data)
    }

    pub fn skip(task: &Task) -> Self {
        Self::with_status(task, ResultStatus::Skip, Payload::new())
    }

    /// Error result; the reason is stored under `data.error`.
    pub fn error(task: &Task, reason: impl Into<String>) -> Self {
        let mut data = Payload::new();
        data.insert("error".to_string(), Value::String(reason.into()));
        Self::with_status(task, ResultStatus::Error, data)
    }

    fn with_status(task: &Task, status: ResultStatus, data: Payload) -> Self {
        Self {
            task_id: task.id.clone(),
            status,
            data,
            created_at: Utc::now(),
            attempts: task.attempts,
        }
    }

    /// Reason attached to an error result, if any.
    pub fn error_reason(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Name of the ready list a task is delivered on: its pool namespace plus
/// its sorted capability requirements.
///
/// Rendered as `<pool>|<label>,<label>`; a task without requirements lands
/// on `<pool>|`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub pool: String,
    pub labels: BTreeSet<String>,
}

impl PoolKey {
    pub fn new(pool: impl Into<String>, labels: BTreeSet<String>) -> Self {
        Self {
            pool: pool.into(),
            labels,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        write!(f, "{}|{}", self.pool, labels.join(","))
    }
}

impl FromStr for PoolKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pool, labels) = s
            .split_once('|')
            .ok_or_else(|| format!("invalid pool key '{s}': missing '|'"))?;
        if pool.is_empty() {
            return Err(format!("invalid pool key '{s}': empty pool"));
        }
        let labels = labels
            .split(',')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            pool: pool.to_string(),
            labels,
        })
    }
}

/// A caller's request to run a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Explicit task id; a fresh UUID is generated when absent.
    pub id: Option<String>,
    pub kind: TaskKind,
    pub pool: String,
    pub payload: Payload,
    pub requires: BTreeSet<String>,
    pub deps: Vec<String>,
    pub edge_pred: Option<String>,
}

impl Submission {
    pub fn new(kind: TaskKind, payload: Payload) -> Self {
        Self {
            id: None,
            kind,
            pool: "default".to_string(),
            payload,
            requires: BTreeSet::new(),
            deps: Vec::new(),
            edge_pred: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn requires(mut self, label: impl Into<String>) -> Self {
        self.requires.insert(label.into());
        self
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    pub fn edge_pred(mut self, pred: impl Into<String>) -> Self {
        self.edge_pred = Some(pred.into());
        self
    }

    /// Predicate with whitespace runs collapsed; blank predicates are dropped.
    pub fn normalized_edge_pred(&self) -> Option<String> {
        self.edge_pred
            .as_deref()
            .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|p| !p.is_empty())
    }

    /// Deterministic hash of the normalized submission parameters.
    ///
    /// The explicit id is not part of the hash: resubmitting the same work
    /// under another id still resolves to the existing run.
    pub fn spec_hash(&self) -> String {
        let mut deps = self.deps.clone();
        deps.sort();
        deps.dedup();
        let normalized = json!({
            "kind": self.kind,
            "pool": self.pool.trim(),
            "payload": Value::Object(self.payload.clone()),
            "requires": self.requires.iter().collect::<Vec<_>>(),
            "deps": deps,
            "edge_pred": self.normalized_edge_pred(),
        });
        sha256_hex(&canonical_bytes(&normalized))
    }
}

/// Persisted, gateway-owned record of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub tenant: String,
    pub kind: TaskKind,
    pub pool: String,
    pub payload: Payload,
    pub requires: BTreeSet<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
    pub status: TaskStatus,
    pub deps: Vec<String>,
    pub edge_pred: Option<String>,
    /// Capability requirements; mirrors `requires`.
    pub labels: Vec<String>,
    pub spec_hash: String,
    pub chain_hash: String,
    /// Data of the accepted result, once the run has succeeded.
    #[serde(default)]
    pub result: Option<Payload>,
    /// Reason of the most recent failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskRun {
    pub fn from_submission(
        id: String,
        tenant: &str,
        submission: &Submission,
        spec_hash: String,
        chain_hash: String,
    ) -> Self {
        let now = Utc::now();
        let mut seen = BTreeSet::new();
        let deps = submission
            .deps
            .iter()
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect();
        Self {
            id,
            tenant: tenant.to_string(),
            kind: submission.kind,
            pool: submission.pool.trim().to_string(),
            payload: submission.payload.clone(),
            requires: submission.requires.clone(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
            status: TaskStatus::Waiting,
            deps,
            edge_pred: submission.normalized_edge_pred(),
            labels: submission.requires.iter().cloned().collect(),
            spec_hash,
            chain_hash,
            result: None,
            error: None,
        }
    }

    /// The queue item for the current attempt.
    pub fn to_task(&self) -> Task {
        Task {
            id: self.id.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            requires: self.requires.clone(),
            attempts: self.attempts,
            created_at: self.created_at,
            schema_version: self.schema_version,
        }
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.pool.clone(), self.requires.clone())
    }

    /// Move to `status`, stamping `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl DependencyRecord for TaskRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn deps(&self) -> &[String] {
        &self.deps
    }
}
