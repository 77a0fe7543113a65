mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::builders::SubmissionBuilder;
use common::fake_handlers::{FlakyHandler, RecordingHandler, echo, hanging, panicking};
use common::harness::{Harness, fast_worker_config};
use common::{init_tracing, with_timeout};
use workdag::metrics::Metrics;
use workdag::queue::{Queue, keys};
use workdag::task::TaskResult;
use workdag::types::{ResultStatus, TaskKind, TaskStatus};
use workdag::worker::{CIRCUIT_OPEN_REASON, HandlerRegistry, WorkerExit};

async fn reported_results(h: &Harness) -> Vec<TaskResult> {
    h.queue
        .range(keys::RESULTS, 0, -1)
        .await
        .unwrap()
        .iter()
        .map(|raw| TaskResult::from_json(raw).unwrap())
        .collect()
}

#[tokio::test]
async fn open_circuit_reports_error_without_invoking_or_charging() {
    init_tracing();
    let h = Harness::new();
    {
        let mut breaker = h.breaker.lock().unwrap();
        for _ in 0..3 {
            breaker.record_failure("execute");
        }
        assert!(breaker.is_open("execute"));
    }
    h.submit(SubmissionBuilder::new("A").build()).await;

    let recorder = RecordingHandler::new();
    let registry = HandlerRegistry::new().register(TaskKind::Execute, recorder.clone());
    let exit = with_timeout(h.worker(registry).run_once()).await;

    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Error));
    assert!(recorder.seen_ids().is_empty());
    let results = reported_results(&h).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error_reason(), Some(CIRCUIT_OPEN_REASON));
    assert_eq!(h.breaker.lock().unwrap().state("execute").unwrap().failure_count, 3);

    h.drain_results().await;
    assert_eq!(h.run("A").error.as_deref(), Some(CIRCUIT_OPEN_REASON));
}

#[tokio::test]
async fn hanging_handler_times_out() {
    init_tracing();
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").build()).await;

    let mut config = fast_worker_config();
    config.task_timeout = Duration::from_millis(100);
    let registry = HandlerRegistry::new().register(TaskKind::Execute, hanging());
    let exit = with_timeout(h.worker_with(registry, config).run_once()).await;

    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Error));
    h.drain_results().await;
    let run = h.run("A");
    assert_eq!(run.status, TaskStatus::Failed);
    assert!(run.error.unwrap().contains("timed out"));
    assert_eq!(h.breaker.lock().unwrap().state("execute").unwrap().failure_count, 1);
}

#[tokio::test]
async fn panicking_handler_becomes_an_error_result() {
    init_tracing();
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").build()).await;

    let registry = HandlerRegistry::new().register(TaskKind::Execute, panicking("kaboom"));
    let exit = with_timeout(h.worker(registry).run_once()).await;

    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Error));
    let results = reported_results(&h).await;
    assert_eq!(results[0].error_reason(), Some("handler panicked: kaboom"));
    assert_eq!(h.queue.in_flight_len(), 0);
}

#[tokio::test]
async fn missing_handler_is_an_error_but_not_a_breaker_failure() {
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").kind(TaskKind::Render).build()).await;

    let registry = HandlerRegistry::new().register(TaskKind::Execute, echo());
    let exit = with_timeout(h.worker(registry).run_once()).await;

    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Error));
    let results = reported_results(&h).await;
    assert!(results[0].error_reason().unwrap().contains("no handler"));
    assert!(h.breaker.lock().unwrap().state("render").is_none());
}

#[tokio::test]
async fn success_resets_consecutive_failures() {
    let h = Harness::new();
    let flaky = FlakyHandler::new(1);
    let registry = HandlerRegistry::new().register(TaskKind::Execute, flaky.clone());

    h.submit(SubmissionBuilder::new("A").build()).await;
    with_timeout(h.worker(registry.clone()).run_once()).await;
    assert_eq!(h.breaker.lock().unwrap().state("execute").unwrap().failure_count, 1);

    h.submit(SubmissionBuilder::new("B").build()).await;
    let exit = with_timeout(h.worker(registry).run_once()).await;
    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Ok));
    assert_eq!(flaky.calls(), 2);
    assert_eq!(h.breaker.lock().unwrap().state("execute").unwrap().failure_count, 0);
}

#[tokio::test]
async fn idle_worker_exits_and_deregisters() {
    let h = Harness::new();
    let worker = h.worker(HandlerRegistry::new().register(TaskKind::Execute, echo()));

    let exit = with_timeout(worker.run_once()).await;
    assert_eq!(exit, WorkerExit::IdleTimeout);
    assert!(h.queue.set_members(keys::WORKERS).await.unwrap().is_empty());
    assert!(!h.queue.exists(&keys::worker(worker.id())).await.unwrap());
}

#[tokio::test]
async fn waiting_worker_is_visible_as_live() {
    let h = Harness::new();
    let mut config = fast_worker_config();
    config.idle_exit = Duration::from_secs(3);
    let worker = h.worker_with(HandlerRegistry::new().register(TaskKind::Execute, echo()), config);
    let id = worker.id().to_string();
    let handle = tokio::spawn(async move { worker.run_once().await });

    let live = with_timeout(async {
        loop {
            let live = h.gateway.live_workers().await.unwrap();
            if !live.is_empty() {
                break live;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(live, vec![id]);

    h.submit(SubmissionBuilder::new("A").build()).await;
    let exit = with_timeout(handle).await.unwrap();
    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Ok));
}

#[tokio::test]
async fn worker_only_takes_tasks_it_is_capable_of() {
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").requires("gpu").build()).await;

    let registry = HandlerRegistry::new().register(TaskKind::Execute, echo());
    let exit = with_timeout(h.worker(registry.clone()).run_once()).await;
    assert_eq!(exit, WorkerExit::IdleTimeout);
    assert_eq!(h.ready_tasks("default|gpu").await.len(), 1);

    let mut config = fast_worker_config();
    config.capabilities = BTreeSet::from(["gpu".to_string(), "shell".to_string()]);
    let exit = with_timeout(h.worker_with(registry, config).run_once()).await;
    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Ok));
}

#[tokio::test]
async fn malformed_item_is_acked_and_dropped() {
    let h = Harness::new();
    h.queue.enqueue("default|", "not a task".to_string()).await.unwrap();

    let exit = with_timeout(
        h.worker(HandlerRegistry::new().register(TaskKind::Execute, echo()))
            .run_once(),
    )
    .await;
    assert_eq!(exit, WorkerExit::Malformed);
    assert_eq!(h.queue.in_flight_len(), 0);
}

#[tokio::test]
async fn orphaned_task_is_completed_by_a_second_worker() {
    init_tracing();
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").build()).await;

    // First consumer claims the task and dies without acking.
    let claimed = h
        .queue
        .dequeue(&["default|".to_string()], Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.queue.in_flight_len(), 1);
    assert!(h.ready_ids().await.is_empty());

    assert_eq!(h.queue.requeue_orphans(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(h.queue.requeue_orphans(Duration::ZERO).await.unwrap(), 0);
    assert_eq!(h.ready_ids().await, vec!["A".to_string()]);

    let recorder = RecordingHandler::new();
    let registry = HandlerRegistry::new().register(TaskKind::Execute, recorder.clone());
    let exit = with_timeout(h.worker(registry).run_once()).await;
    assert_eq!(exit, WorkerExit::Completed(ResultStatus::Ok));
    assert_eq!(recorder.seen_ids(), vec!["A".to_string()]);

    // The dead consumer's delivery was reclaimed, so its ack finds nothing.
    assert!(!h.queue.ack(&claimed).await.unwrap());

    h.drain_results().await;
    assert_eq!(h.status("A"), TaskStatus::Success);
}

#[tokio::test]
async fn recent_claims_are_not_orphans() {
    let h = Harness::new();
    h.submit(SubmissionBuilder::new("A").build()).await;
    h.queue
        .dequeue(&["default|".to_string()], Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.queue.requeue_orphans(Duration::from_secs(600)).await.unwrap(), 0);
    assert_eq!(h.queue.in_flight_len(), 1);
}

#[tokio::test]
async fn worker_metrics_are_recorded() {
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    h.submit(SubmissionBuilder::new("A").build()).await;

    let worker = h
        .worker(HandlerRegistry::new().register(TaskKind::Execute, echo()))
        .with_metrics(metrics.clone());
    with_timeout(worker.run_once()).await;

    assert_eq!(metrics.task_count(ResultStatus::Ok), 1);
    assert_eq!(metrics.exit_count("completed"), 1);
    assert_eq!(metrics.runtime_samples(), 1);
    assert!(metrics.encode_text().unwrap().contains("worker_task_total"));
}
