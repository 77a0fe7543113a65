// src/metrics.rs

//! Prometheus metrics for workers and the warm-pool spawner.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `worker_task_total` | Counter | `status` |
//! | `worker_runtime_seconds` | Histogram | |
//! | `worker_exit_reason` | Counter | `reason` |
//! | `warm_spawner_live_workers` | Gauge | |
//! | `queue_pending_total` | Gauge | `kind` |
//!
//! Each [`Metrics`] owns its own registry, so tests can build as many as
//! they like without name clashes.

use std::collections::BTreeMap;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use thiserror::Error;

use crate::types::{ResultStatus, TaskKind};

/// Buckets of `worker_runtime_seconds`; `+Inf` is implicit.
pub const RUNTIME_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Every exit reason a worker can report.
pub const EXIT_REASONS: &[&str] = &[
    "completed",
    "idle_timeout",
    "discarded",
    "malformed",
    "queue_error",
];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Serializable point-in-time view of every metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub worker_task_total: BTreeMap<String, u64>,
    pub worker_runtime_count: u64,
    pub worker_runtime_sum: f64,
    pub worker_exit_reason: BTreeMap<String, u64>,
    pub warm_spawner_live_workers: i64,
    pub queue_pending_total: BTreeMap<String, i64>,
}

/// Handles to the registered metrics. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    worker_task_total: IntCounterVec,
    worker_runtime_seconds: Histogram,
    worker_exit_reason: IntCounterVec,
    warm_spawner_live_workers: IntGauge,
    queue_pending_total: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let worker_task_total = IntCounterVec::new(
            Opts::new("worker_task_total", "Tasks executed by workers, by result status"),
            &["status"],
        )?;
        registry.register(Box::new(worker_task_total.clone()))?;

        let worker_runtime_seconds = Histogram::with_opts(
            HistogramOpts::new("worker_runtime_seconds", "Wall time spent executing a task")
                .buckets(RUNTIME_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(worker_runtime_seconds.clone()))?;

        let worker_exit_reason = IntCounterVec::new(
            Opts::new("worker_exit_reason", "Worker exits, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(worker_exit_reason.clone()))?;

        let warm_spawner_live_workers = IntGauge::new(
            "warm_spawner_live_workers",
            "Workers currently alive in the warm pool",
        )?;
        registry.register(Box::new(warm_spawner_live_workers.clone()))?;

        let queue_pending_total = IntGaugeVec::new(
            Opts::new("queue_pending_total", "Ready tasks waiting in the queue, by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(queue_pending_total.clone()))?;

        Ok(Self {
            registry,
            worker_task_total,
            worker_runtime_seconds,
            worker_exit_reason,
            warm_spawner_live_workers,
            queue_pending_total,
        })
    }

    pub fn task_completed(&self, status: ResultStatus) {
        self.worker_task_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn observe_runtime(&self, seconds: f64) {
        self.worker_runtime_seconds.observe(seconds);
    }

    pub fn worker_exited(&self, reason: &str) {
        self.worker_exit_reason.with_label_values(&[reason]).inc();
    }

    pub fn set_live_workers(&self, n: usize) {
        self.warm_spawner_live_workers
            .set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    pub fn set_queue_pending(&self, kind: &str, n: usize) {
        self.queue_pending_total
            .with_label_values(&[kind])
            .set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    #[must_use]
    pub fn task_count(&self, status: ResultStatus) -> u64 {
        self.worker_task_total
            .with_label_values(&[status.as_str()])
            .get()
    }

    #[must_use]
    pub fn exit_count(&self, reason: &str) -> u64 {
        self.worker_exit_reason.with_label_values(&[reason]).get()
    }

    #[must_use]
    pub fn live_workers(&self) -> i64 {
        self.warm_spawner_live_workers.get()
    }

    #[must_use]
    pub fn queue_pending(&self, kind: &str) -> i64 {
        self.queue_pending_total.with_label_values(&[kind]).get()
    }

    #[must_use]
    pub fn runtime_samples(&self) -> u64 {
        self.worker_runtime_seconds.get_sample_count()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let statuses = [ResultStatus::Ok, ResultStatus::Error, ResultStatus::Skip];
        MetricsSnapshot {
            worker_task_total: statuses
                .iter()
                .map(|s| (s.as_str().to_string(), self.task_count(*s)))
                .collect(),
            worker_runtime_count: self.worker_runtime_seconds.get_sample_count(),
            worker_runtime_sum: self.worker_runtime_seconds.get_sample_sum(),
            worker_exit_reason: EXIT_REASONS
                .iter()
                .map(|r| (r.to_string(), self.exit_count(r)))
                .collect(),
            warm_spawner_live_workers: self.live_workers(),
            queue_pending_total: TaskKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), self.queue_pending(k.as_str())))
                .collect(),
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_are_recorded() {
        let m = Metrics::new().unwrap();
        m.task_completed(ResultStatus::Ok);
        m.task_completed(ResultStatus::Ok);
        m.task_completed(ResultStatus::Error);
        m.worker_exited("idle_timeout");
        m.set_live_workers(3);
        m.set_queue_pending("render", 7);
        m.observe_runtime(0.2);

        assert_eq!(m.task_count(ResultStatus::Ok), 2);
        assert_eq!(m.exit_count("idle_timeout"), 1);
        assert_eq!(m.live_workers(), 3);

        let snap = m.snapshot();
        assert_eq!(snap.worker_task_total["error"], 1);
        assert_eq!(snap.queue_pending_total["render"], 7);
        assert_eq!(snap.queue_pending_total["mutate"], 0);
        assert_eq!(snap.worker_runtime_count, 1);
    }

    #[test]
    fn text_exposition_uses_stable_names() {
        let m = Metrics::new().unwrap();
        m.observe_runtime(42.0);
        m.worker_exited("completed");
        let text = m.encode_text().unwrap();
        assert!(text.contains("worker_runtime_seconds_bucket{le=\"60\"} 1"));
        assert!(text.contains("worker_exit_reason{reason=\"completed\"} 1"));
        assert!(text.contains("warm_spawner_live_workers 0"));
    }
}
