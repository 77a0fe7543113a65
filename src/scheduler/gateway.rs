// src/scheduler/gateway.rs

//! The control plane: owns task runs, gates them on their dependencies and
//! hands ready work to the queue.
//!
//! Per-run state machine:
//!
//! ```text
//! waiting -> running -> success | failed
//! waiting | running -> paused -> waiting
//! waiting | running | paused -> canceled
//! failed -> waiting               (retry, retry_from)
//! ```
//!
//! Every persisted transition also rewrites the run's TTL-bounded snapshot
//! (`task:<id>`, read by workers) and publishes a `task.update` event.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Result, WorkdagError};
use crate::integrity::{ManifestHandle, TaskChainer};
use crate::queue::{Queue, QueueError, keys};
use crate::scheduler::predicate::Predicate;
use crate::scheduler::store::{RunStore, StoreError, Transition};
use crate::task::{PoolKey, Submission, Task, TaskResult, TaskRun, canonical_bytes};
use crate::types::{ResultStatus, TaskStatus};

/// How long a run snapshot survives in the queue backend without updates.
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of [`Gateway::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub run: TaskRun,
    /// `false` when an identical submission already existed.
    pub created: bool,
}

/// What [`Gateway::handle_result`] did with a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultDisposition {
    Accepted(TaskRun),
    Discarded { task_id: String, reason: String },
}

pub struct Gateway {
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) store: Arc<dyn RunStore>,
    chainer: Mutex<TaskChainer>,
    /// `(tenant, label)` pairs whose waiting runs are held back.
    held_labels: Mutex<BTreeSet<(String, String)>>,
    manifest: Option<ManifestHandle>,
    task_ttl: Duration,
}

impl Gateway {
    pub fn new(queue: Arc<dyn Queue>, store: Arc<dyn RunStore>, chainer: TaskChainer) -> Self {
        Self {
            queue,
            store,
            chainer: Mutex::new(chainer),
            held_labels: Mutex::new(BTreeSet::new()),
            manifest: None,
            task_ttl: DEFAULT_TASK_TTL,
        }
    }

    pub fn with_manifest(mut self, handle: ManifestHandle) -> Self {
        self.manifest = Some(handle);
        self
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    /// Current head of the integrity chain.
    pub fn chain_head(&self) -> String {
        self.chainer().head().to_string()
    }

    fn chainer(&self) -> MutexGuard<'_, TaskChainer> {
        self.chainer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn held_labels(&self) -> MutexGuard<'_, BTreeSet<(String, String)>> {
        self.held_labels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate and persist a submission, or return the run that an
    /// identical earlier submission created.
    pub async fn submit(&self, tenant: &str, submission: Submission) -> Result<SubmitOutcome> {
        self.validate(tenant, &submission)?;
        let spec_hash = submission.spec_hash();

        if let Some(existing) = self
            .store
            .list(tenant)?
            .into_iter()
            .find(|r| r.spec_hash == spec_hash)
        {
            debug!(task = %existing.id, %tenant, "duplicate submission resolved to existing run");
            return Ok(SubmitOutcome {
                run: existing,
                created: false,
            });
        }

        let (run, created) = self.insert_chained(tenant, &submission, spec_hash)?;

        if !created {
            return Ok(SubmitOutcome { run, created });
        }

        info!(task = %run.id, %tenant, kind = %run.kind, pool = %run.pool_key(), "task submitted");
        if let Err(e) = self.record_transition(&run).await {
            warn!(task = %run.id, error = %e, "failed to write submission snapshot");
        }
        self.schedule_pass().await?;

        let run = self.store.get(&run.id)?.unwrap_or(run);
        Ok(SubmitOutcome { run, created: true })
    }

    /// Insert the run and fold its payload into the chain, under the chain
    /// lock. Only a newly created run advances the chain.
    fn insert_chained(
        &self,
        tenant: &str,
        submission: &Submission,
        spec_hash: String,
    ) -> Result<(TaskRun, bool)> {
        let mut chainer = self.chainer();
        let chain_hash = chainer.next_task_head(&submission.payload);
        let mut id = submission
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (run, created) = loop {
            let run = TaskRun::from_submission(
                id.clone(),
                tenant,
                submission,
                spec_hash.clone(),
                chain_hash.clone(),
            );
            match self.store.insert_unique(run) {
                Ok(stored) => break stored,
                Err(StoreError::DuplicateId(taken)) => {
                    id = Uuid::new_v4().to_string();
                    warn!(requested = %taken, assigned = %id, "task id already taken; assigned a fresh id");
                }
                Err(e) => return Err(e.into()),
            }
        };

        if created {
            if let Err(e) = chainer.add_task(&submission.payload) {
                warn!(task = %run.id, error = %e, "failed to persist chain head");
            }
        }
        Ok((run, created))
    }

    fn validate(&self, tenant: &str, submission: &Submission) -> Result<()> {
        let pool = submission.pool.trim();
        if pool.is_empty() || pool.contains('|') {
            return Err(WorkdagError::Validation(format!(
                "invalid pool '{}'",
                submission.pool
            )));
        }

        if let Some(bad) = submission.requires.iter().find(|l| !valid_label(l)) {
            return Err(WorkdagError::Validation(format!(
                "invalid capability label '{bad}'"
            )));
        }

        if let Some(id) = &submission.id {
            if id.trim().is_empty() {
                return Err(WorkdagError::Validation("task id must not be empty".into()));
            }
            if submission.deps.iter().any(|d| d == id) {
                return Err(WorkdagError::Validation(format!(
                    "task '{id}' depends on itself"
                )));
            }
        }

        for dep in &submission.deps {
            match self.store.get(dep)? {
                Some(run) if run.tenant == tenant => {}
                _ => {
                    return Err(WorkdagError::Validation(format!(
                        "unknown dependency '{dep}'"
                    )));
                }
            }
        }

        if let Some(pred) = submission.normalized_edge_pred() {
            Predicate::parse(&pred).map_err(|e| WorkdagError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Gating
    // -----------------------------------------------------------------------

    /// Whether every dependency of `run` succeeded and its edge predicate
    /// (if any) holds over the dependency outputs.
    pub fn deps_satisfied(&self, run: &TaskRun) -> Result<bool> {
        let mut deps = HashMap::new();
        for id in &run.deps {
            if let Some(dep) = self.store.get(id)? {
                deps.insert(id.clone(), dep);
            }
        }
        Ok(deps_satisfied(run, &deps))
    }

    /// Move every waiting run whose dependencies are satisfied and whose
    /// labels are not paused to `running` and enqueue its task. Returns the
    /// scheduled ids.
    pub async fn schedule_pass(&self) -> Result<Vec<String>> {
        let runs = self.store.list_all()?;
        let by_id: HashMap<String, TaskRun> =
            runs.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let held = self.held_labels().clone();

        let ready: Vec<String> = runs
            .iter()
            .filter(|r| {
                r.status == TaskStatus::Waiting
                    && !held_by_label(&held, r)
                    && deps_satisfied(r, &by_id)
            })
            .map(|r| r.id.clone())
            .collect();

        let mut scheduled = Vec::with_capacity(ready.len());
        for id in ready {
            let transitions = self.store.apply(std::slice::from_ref(&id), &mut |run| {
                if run.status != TaskStatus::Waiting {
                    return Err(format!("run is {}", run.status));
                }
                run.set_status(TaskStatus::Running);
                Ok(())
            })?;
            let Some(Transition::Applied(run)) = transitions.into_iter().next() else {
                continue;
            };

            if let Err(e) = self.dispatch(&run).await {
                self.revert_to_waiting(&run).await?;
                return Err(e);
            }
            scheduled.push(id);
        }

        if !scheduled.is_empty() {
            debug!(?scheduled, "scheduling pass enqueued tasks");
        }
        Ok(scheduled)
    }

    /// Snapshot first, so a worker that dequeues immediately already sees
    /// the run as `running`.
    async fn dispatch(&self, run: &TaskRun) -> Result<()> {
        self.record_transition(run).await?;
        let item = run.to_task().to_json()?;
        let pool = run.pool_key().to_string();
        self.queue.enqueue(&pool, item).await?;
        info!(task = %run.id, %pool, attempts = run.attempts, "task enqueued");
        Ok(())
    }

    async fn revert_to_waiting(&self, run: &TaskRun) -> Result<()> {
        warn!(task = %run.id, "enqueue failed; moving run back to waiting");
        let transitions = self.store.apply(std::slice::from_ref(&run.id), &mut |r| {
            if r.status == TaskStatus::Running && r.attempts == run.attempts {
                r.set_status(TaskStatus::Waiting);
            }
            Ok(())
        })?;
        if let Some(Transition::Applied(reverted)) = transitions.first() {
            if let Err(e) = self.record_transition(reverted).await {
                warn!(task = %reverted.id, error = %e, "failed to rewrite snapshot after revert");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Apply a worker result to its run.
    ///
    /// Only a `running` run with the same attempt count accepts a result;
    /// anything else (canceled, paused, retried, duplicate delivery) is
    /// discarded.
    pub async fn handle_result(&self, result: TaskResult) -> Result<ResultDisposition> {
        let id = result.task_id.clone();
        let transitions = match self.store.apply(std::slice::from_ref(&id), &mut |run| {
            if run.status != TaskStatus::Running {
                return Err(format!("run is {}", run.status));
            }
            if run.attempts != result.attempts {
                return Err(format!(
                    "stale attempt {} (current {})",
                    result.attempts, run.attempts
                ));
            }
            match result.status {
                ResultStatus::Ok | ResultStatus::Skip => {
                    run.result = Some(result.data.clone());
                    run.error = None;
                    run.set_status(TaskStatus::Success);
                }
                ResultStatus::Error => {
                    run.error = Some(result.error_reason().unwrap_or("unknown error").to_string());
                    run.set_status(TaskStatus::Failed);
                }
            }
            Ok(())
        }) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => {
                warn!(task = %id, "result for unknown task discarded");
                return Ok(ResultDisposition::Discarded {
                    task_id: id,
                    reason: "unknown task".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let run = match transitions.into_iter().next() {
            Some(Transition::Applied(run)) => run,
            Some(Transition::Rejected { id, reason }) => {
                info!(task = %id, %reason, status = %result.status, "result discarded");
                return Ok(ResultDisposition::Discarded { task_id: id, reason });
            }
            None => {
                return Ok(ResultDisposition::Discarded {
                    task_id: id,
                    reason: "no transition".to_string(),
                });
            }
        };

        info!(task = %run.id, status = %run.status, attempts = run.attempts, "result accepted");
        if let Err(e) = self.record_transition(&run).await {
            warn!(task = %run.id, error = %e, "failed to write result snapshot");
        }
        self.record_outcome(&run, &result).await;

        if let Err(e) = self.schedule_pass().await {
            warn!(task = %run.id, error = %e, "scheduling pass after result failed");
        }
        Ok(ResultDisposition::Accepted(run))
    }

    /// Fold the accepted result into the chain and the manifest.
    async fn record_outcome(&self, run: &TaskRun, result: &TaskResult) {
        let data = Value::Object(result.data.clone());
        let head = match self.chainer().add_artifact(&canonical_bytes(&data)) {
            Ok(head) => Some(head),
            Err(e) => {
                warn!(task = %run.id, error = %e, "failed to advance integrity chain");
                None
            }
        };

        let Some(manifest) = &self.manifest else {
            return;
        };
        let record = json!({
            "task_id": run.id,
            "tenant": run.tenant,
            "kind": run.kind,
            "status": run.status,
            "result_status": result.status,
            "attempts": run.attempts,
            "spec_hash": run.spec_hash,
            "chain_hash": head,
            "data": data,
            "recorded_at": Utc::now(),
        });
        if let Err(e) = manifest.append(record).await {
            warn!(task = %run.id, error = %e, "failed to append manifest record");
        }
    }

    /// Drain the results list. Waits up to `timeout` for the first result.
    ///
    /// Returns how many results were consumed (accepted or discarded).
    pub async fn process_results(&self, timeout: Duration) -> Result<usize> {
        let mut handled = 0;
        let mut wait = timeout;
        while let Some(raw) = self.queue.pop_left(keys::RESULTS, wait).await? {
            wait = Duration::ZERO;
            handled += 1;
            match TaskResult::from_json(&raw) {
                Ok(result) => {
                    if let Err(e) = self.handle_result(result).await {
                        warn!(error = %e, "failed to handle task result");
                    }
                }
                Err(e) => warn!(error = %e, "malformed task result dropped"),
            }
        }
        Ok(handled)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<TaskRun> {
        self.store
            .get(id)?
            .ok_or_else(|| WorkdagError::NotFound(id.to_string()))
    }

    pub fn list(&self, tenant: &str) -> Result<Vec<TaskRun>> {
        Ok(self.store.list(tenant)?)
    }

    /// Tasks currently waiting on one ready list.
    pub async fn pool_tasks(&self, pool: &PoolKey) -> Result<Vec<Task>> {
        let items = self.queue.range(&keys::ready(&pool.to_string()), 0, -1).await?;
        Ok(items
            .iter()
            .filter_map(|raw| Task::from_json(raw).ok())
            .collect())
    }

    /// Registered workers whose presence entry has not expired.
    pub async fn live_workers(&self) -> Result<Vec<String>> {
        let mut live = Vec::new();
        for id in self.queue.set_members(keys::WORKERS).await? {
            if self.queue.exists(&keys::worker(&id)).await? {
                live.push(id);
            }
        }
        Ok(live)
    }

    /// `true` once no run is running and no waiting run can become ready.
    ///
    /// Waiting runs behind a failed, paused or canceled dependency (or a
    /// false edge predicate, or a paused label) count as settled.
    pub fn is_settled(&self) -> Result<bool> {
        let runs = self.store.list_all()?;
        let by_id: HashMap<String, TaskRun> =
            runs.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let held = self.held_labels().clone();
        Ok(runs.iter().all(|r| match r.status {
            TaskStatus::Running => false,
            TaskStatus::Waiting => held_by_label(&held, r) || !deps_satisfied(r, &by_id),
            _ => true,
        }))
    }

    // -----------------------------------------------------------------------
    // Snapshots and events
    // -----------------------------------------------------------------------

    pub(crate) async fn record_transition(&self, run: &TaskRun) -> std::result::Result<(), QueueError> {
        let key = keys::task(&run.id);
        let blob = serde_json::to_string(run).unwrap_or_default();
        self.queue
            .hash_set(
                &key,
                &[("blob", blob), ("status", run.status.as_str().to_string())],
            )
            .await?;
        self.queue.expire(&key, self.task_ttl).await?;
        self.publish_event(run).await;
        Ok(())
    }

    async fn publish_event(&self, run: &TaskRun) {
        let event = json!({
            "specversion": "1.0",
            "type": "task.update",
            "source": "workdag.gateway",
            "id": Uuid::new_v4().to_string(),
            "time": Utc::now(),
            "subject": run.id,
            "datacontenttype": "application/json",
            "data": {
                "id": run.id,
                "tenant": run.tenant,
                "status": run.status,
                "attempts": run.attempts,
                "pool": run.pool_key().to_string(),
            },
        });
        if let Err(e) = self.queue.push_right(keys::EVENTS, event.to_string()).await {
            warn!(task = %run.id, error = %e, "failed to publish task event");
        }
    }
}

/// Pure gating check against a map of known runs.
///
/// Unknown dependencies count as unsatisfied. A predicate that fails to
/// parse also gates the run (submission rejects those up front).
pub fn deps_satisfied(run: &TaskRun, runs: &HashMap<String, TaskRun>) -> bool {
    let mut outputs = HashMap::with_capacity(run.deps.len());
    for id in &run.deps {
        match runs.get(id) {
            Some(dep) if dep.status == TaskStatus::Success => {
                outputs.insert(id.clone(), dep.result.clone().unwrap_or_default());
            }
            _ => return false,
        }
    }

    match run.edge_pred.as_deref() {
        None => true,
        Some(src) => match Predicate::parse(src) {
            Ok(pred) => pred.evaluate(&outputs),
            Err(e) => {
                warn!(task = %run.id, error = %e, "unparseable edge predicate");
                false
            }
        },
    }
}

/// Whether any of `run`'s labels is paused for its tenant.
pub(crate) fn held_by_label(held: &BTreeSet<(String, String)>, run: &TaskRun) -> bool {
    run.labels
        .iter()
        .any(|label| held.contains(&(run.tenant.clone(), label.clone())))
}

/// A worker may take a task when it advertises every required label.
pub fn worker_supports(capabilities: &BTreeSet<String>, required: &BTreeSet<String>) -> bool {
    required.is_subset(capabilities)
}

pub(crate) fn valid_label(label: &str) -> bool {
    !label.is_empty() && !label.contains([',', '|']) && !label.chars().any(char::is_whitespace)
}
