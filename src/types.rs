// src/types.rs

//! Closed enums shared by the task model, the gateway and the workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Handler-selection key of a task.
///
/// The engine never looks inside a task beyond this tag; the worker uses it
/// to pick a handler from its registry and as the circuit breaker key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Render,
    Mutate,
    Execute,
    Evaluate,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Render,
        TaskKind::Mutate,
        TaskKind::Execute,
        TaskKind::Evaluate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Render => "render",
            TaskKind::Mutate => "mutate",
            TaskKind::Execute => "execute",
            TaskKind::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "render" => Ok(TaskKind::Render),
            "mutate" => Ok(TaskKind::Mutate),
            "execute" => Ok(TaskKind::Execute),
            "evaluate" => Ok(TaskKind::Evaluate),
            other => Err(format!(
                "invalid task kind: {other} (expected \"render\", \"mutate\", \"execute\" or \"evaluate\")"
            )),
        }
    }
}

/// Lifecycle state of a persisted task run.
///
/// ```text
/// waiting -> running -> success | failed
/// waiting | running -> paused -> waiting
/// waiting | running | paused -> canceled
/// failed -> waiting            (retry / retry_from)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Paused,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// `success`, `failed` and `canceled` end a run; only retries leave
    /// `failed` again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Waiting
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "paused" => Ok(TaskStatus::Paused),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// Outcome carried by a [`crate::task::TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
    Skip,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::Error => "error",
            ResultStatus::Skip => "skip",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
