// src/scheduler/control.rs

//! Control operations over sets of task runs.
//!
//! Each operation is all-or-nothing per task: a run is either fully
//! transitioned and persisted, or left untouched and reported as rejected.
//! An unknown id aborts the whole call before anything changes.
//!
//! Label-scoped variants act on every run of a tenant that carries a
//! label. Pausing a label holds that tenant's matching runs in `waiting`;
//! runs already enqueued are not recalled.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::dag::graph::transitive_dependents;
use crate::errors::{Result, WorkdagError};
use crate::scheduler::gateway::{Gateway, valid_label};
use crate::scheduler::store::{StoreError, Transition};
use crate::task::TaskRun;
use crate::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    Pause,
    Resume,
    Cancel,
    Retry,
    RetryFrom,
}

impl ControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOp::Pause => "pause",
            ControlOp::Resume => "resume",
            ControlOp::Cancel => "cancel",
            ControlOp::Retry => "retry",
            ControlOp::RetryFrom => "retry_from",
        }
    }

    /// Operations that put runs back in line for execution.
    fn reschedules(&self) -> bool {
        matches!(self, ControlOp::Resume | ControlOp::Retry | ControlOp::RetryFrom)
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pause" => Ok(ControlOp::Pause),
            "resume" => Ok(ControlOp::Resume),
            "cancel" => Ok(ControlOp::Cancel),
            "retry" => Ok(ControlOp::Retry),
            "retry_from" => Ok(ControlOp::RetryFrom),
            other => Err(format!("unknown control operation: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub id: String,
    pub reason: String,
}

/// Per-task outcome of a control operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControlReport {
    pub applied: Vec<String>,
    pub rejected: Vec<Rejection>,
}

impl ControlReport {
    fn absorb(&mut self, transitions: &[Transition]) {
        for t in transitions {
            match t {
                Transition::Applied(run) => self.applied.push(run.id.clone()),
                Transition::Rejected { id, reason } => self.rejected.push(Rejection {
                    id: id.clone(),
                    reason: reason.clone(),
                }),
            }
        }
    }
}

/// The state change `op` makes to a single run.
///
/// `retry_from` uses [`reset_for_retry`] on the whole affected set instead.
pub fn transition(op: ControlOp, run: &mut TaskRun) -> std::result::Result<(), String> {
    let status = run.status;
    let allowed = match op {
        ControlOp::Pause => matches!(status, TaskStatus::Waiting | TaskStatus::Running),
        ControlOp::Resume => status == TaskStatus::Paused,
        ControlOp::Cancel => matches!(
            status,
            TaskStatus::Waiting | TaskStatus::Running | TaskStatus::Paused
        ),
        ControlOp::Retry | ControlOp::RetryFrom => status == TaskStatus::Failed,
    };
    if !allowed {
        return Err(format!("cannot {op} a {status} task"));
    }

    match op {
        ControlOp::Pause => run.set_status(TaskStatus::Paused),
        ControlOp::Resume => run.set_status(TaskStatus::Waiting),
        ControlOp::Cancel => run.set_status(TaskStatus::Canceled),
        ControlOp::Retry | ControlOp::RetryFrom => reset_for_retry(run)?,
    }
    Ok(())
}

/// Put a run back to `waiting` for another attempt.
///
/// Runs that already executed (`success` or `failed`) get a new attempt
/// number so stale results from the earlier attempt are discarded.
pub fn reset_for_retry(run: &mut TaskRun) -> std::result::Result<(), String> {
    if run.status == TaskStatus::Running {
        return Err("task is running".to_string());
    }
    if matches!(run.status, TaskStatus::Success | TaskStatus::Failed) {
        run.attempts += 1;
    }
    run.result = None;
    run.error = None;
    run.set_status(TaskStatus::Waiting);
    Ok(())
}

impl Gateway {
    pub async fn pause(&self, ids: &[String]) -> Result<ControlReport> {
        self.control(ControlOp::Pause, ids).await
    }

    pub async fn resume(&self, ids: &[String]) -> Result<ControlReport> {
        self.control(ControlOp::Resume, ids).await
    }

    pub async fn cancel(&self, ids: &[String]) -> Result<ControlReport> {
        self.control(ControlOp::Cancel, ids).await
    }

    pub async fn retry(&self, ids: &[String]) -> Result<ControlReport> {
        self.control(ControlOp::Retry, ids).await
    }

    /// Re-run each failed root and everything that transitively depends
    /// on it.
    pub async fn retry_from(&self, ids: &[String]) -> Result<ControlReport> {
        self.control(ControlOp::RetryFrom, ids).await
    }

    /// Hold back every waiting run of `tenant` labelled `label`.
    ///
    /// Returns the ids of the runs currently held.
    pub fn pause_label(&self, tenant: &str, label: &str) -> Result<Vec<String>> {
        check_label(label)?;
        self.held_labels().insert((tenant.to_string(), label.to_string()));
        let held = self.labelled(tenant, label, &[TaskStatus::Waiting])?;
        info!(%tenant, %label, held = held.len(), "label paused");
        Ok(held)
    }

    /// Release a paused label and schedule whatever became ready.
    ///
    /// Returns the ids carrying `label` that this call enqueued.
    pub async fn resume_label(&self, tenant: &str, label: &str) -> Result<Vec<String>> {
        check_label(label)?;
        let removed = self
            .held_labels()
            .remove(&(tenant.to_string(), label.to_string()));
        if !removed {
            return Ok(Vec::new());
        }
        info!(%tenant, %label, "label resumed");

        let labelled: HashSet<String> = self
            .labelled(tenant, label, &[TaskStatus::Waiting])?
            .into_iter()
            .collect();
        let scheduled = self.schedule_pass().await?;
        Ok(scheduled
            .into_iter()
            .filter(|id| labelled.contains(id))
            .collect())
    }

    /// Cancel every unfinished run of `tenant` labelled `label`.
    pub async fn cancel_label(&self, tenant: &str, label: &str) -> Result<ControlReport> {
        check_label(label)?;
        let ids = self.labelled(
            tenant,
            label,
            &[TaskStatus::Waiting, TaskStatus::Running, TaskStatus::Paused],
        )?;
        self.control(ControlOp::Cancel, &ids).await
    }

    /// Labels of `tenant` that are currently paused.
    pub fn paused_labels(&self, tenant: &str) -> Vec<String> {
        self.held_labels()
            .iter()
            .filter(|(t, _)| t == tenant)
            .map(|(_, label)| label.clone())
            .collect()
    }

    fn labelled(&self, tenant: &str, label: &str, statuses: &[TaskStatus]) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(tenant)?
            .into_iter()
            .filter(|r| statuses.contains(&r.status) && r.labels.iter().any(|l| l == label))
            .map(|r| r.id)
            .collect())
    }

    pub async fn control(&self, op: ControlOp, ids: &[String]) -> Result<ControlReport> {
        let transitions = match op {
            ControlOp::RetryFrom => self.apply_retry_from(ids)?,
            _ => self
                .store
                .apply(ids, &mut |run| transition(op, run))
                .map_err(not_found)?,
        };

        let mut report = ControlReport::default();
        report.absorb(&transitions);
        info!(
            %op,
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            "control operation applied"
        );

        for t in &transitions {
            if let Transition::Applied(run) = t {
                if let Err(e) = self.record_transition(run).await {
                    warn!(task = %run.id, error = %e, "failed to write control snapshot");
                }
            }
        }

        if op.reschedules() && !report.applied.is_empty() {
            self.schedule_pass().await?;
        }
        Ok(report)
    }

    fn apply_retry_from(&self, roots: &[String]) -> Result<Vec<Transition>> {
        let mut failed_roots = Vec::new();
        let mut rejected = Vec::new();
        for id in roots {
            let run = self.store.get(id)?.ok_or_else(|| WorkdagError::NotFound(id.clone()))?;
            if run.status == TaskStatus::Failed {
                failed_roots.push(run);
            } else {
                rejected.push(Transition::Rejected {
                    id: id.clone(),
                    reason: format!("cannot retry_from a {} task", run.status),
                });
            }
        }

        let mut targets: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let tenants: BTreeSet<&str> = failed_roots.iter().map(|r| r.tenant.as_str()).collect();
        for tenant in tenants {
            let runs = self.store.list(tenant)?;
            for root in failed_roots.iter().filter(|r| r.tenant == tenant) {
                let mut affected = vec![root.id.clone()];
                affected.extend(transitive_dependents(&runs, &root.id)?);
                for id in affected {
                    if seen.insert(id.clone()) {
                        targets.push(id);
                    }
                }
            }
        }

        let mut transitions = self
            .store
            .apply(&targets, &mut reset_for_retry)
            .map_err(not_found)?;
        transitions.extend(rejected);
        Ok(transitions)
    }
}

fn check_label(label: &str) -> Result<()> {
    if valid_label(label) {
        Ok(())
    } else {
        Err(WorkdagError::Validation(format!("invalid label '{label}'")))
    }
}

fn not_found(e: StoreError) -> WorkdagError {
    match e {
        StoreError::NotFound(id) => WorkdagError::NotFound(id),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::task::Submission;
    use crate::types::TaskKind;

    fn run(status: TaskStatus) -> TaskRun {
        let sub = Submission::new(TaskKind::Render, Map::new());
        let mut r = TaskRun::from_submission("x".into(), "t", &sub, sub.spec_hash(), String::new());
        r.status = status;
        r
    }

    #[test]
    fn allowed_transitions() {
        let cases = [
            (ControlOp::Pause, TaskStatus::Waiting, Some(TaskStatus::Paused)),
            (ControlOp::Pause, TaskStatus::Running, Some(TaskStatus::Paused)),
            (ControlOp::Pause, TaskStatus::Success, None),
            (ControlOp::Resume, TaskStatus::Paused, Some(TaskStatus::Waiting)),
            (ControlOp::Resume, TaskStatus::Waiting, None),
            (ControlOp::Cancel, TaskStatus::Paused, Some(TaskStatus::Canceled)),
            (ControlOp::Cancel, TaskStatus::Failed, None),
            (ControlOp::Retry, TaskStatus::Failed, Some(TaskStatus::Waiting)),
            (ControlOp::Retry, TaskStatus::Success, None),
        ];
        for (op, from, to) in cases {
            let mut r = run(from);
            let outcome = transition(op, &mut r);
            match to {
                Some(expected) => {
                    assert!(outcome.is_ok(), "{op} from {from}");
                    assert_eq!(r.status, expected);
                }
                None => {
                    assert!(outcome.is_err(), "{op} from {from} should be rejected");
                    assert_eq!(r.status, from);
                }
            }
        }
    }

    #[test]
    fn retry_bumps_attempts_and_clears_error() {
        let mut r = run(TaskStatus::Failed);
        r.error = Some("boom".into());
        transition(ControlOp::Retry, &mut r).unwrap();
        assert_eq!(r.attempts, 1);
        assert_eq!(r.error, None);
    }

    #[test]
    fn reset_leaves_unexecuted_attempts_alone() {
        let mut waiting = run(TaskStatus::Waiting);
        reset_for_retry(&mut waiting).unwrap();
        assert_eq!(waiting.attempts, 0);

        let mut running = run(TaskStatus::Running);
        assert!(reset_for_retry(&mut running).is_err());
    }

    #[test]
    fn op_names_parse() {
        assert_eq!("retry-from".parse::<ControlOp>(), Ok(ControlOp::RetryFrom));
        assert_eq!("CANCEL".parse::<ControlOp>(), Ok(ControlOp::Cancel));
        assert!("explode".parse::<ControlOp>().is_err());
    }
}
