mod common;

use std::sync::Arc;
use std::time::Duration;

use common::builders::SubmissionBuilder;
use common::fake_handlers::{echo, hanging};
use common::harness::{Harness, fast_worker_config};
use common::{init_tracing, with_timeout};
use tokio::sync::watch;
use workdag::metrics::Metrics;
use workdag::queue::{Queue, keys};
use workdag::spawner::{SpawnerConfig, WarmPoolSpawner};
use workdag::task::Task;
use workdag::types::TaskKind;
use workdag::worker::{
    CircuitBreaker, Handler, HandlerError, HandlerRegistry, Outcome, WorkerConfig, handler_fn,
};

fn spawner_config(warm: usize, max: usize) -> SpawnerConfig {
    SpawnerConfig {
        warm_pool_size: warm,
        max_workers: max,
        poll_interval: Duration::from_millis(20),
        orphan_idle_threshold: Duration::from_secs(600),
        pending_scan_limit: 100,
    }
}

fn patient_workers() -> WorkerConfig {
    let mut config = fast_worker_config();
    config.idle_exit = Duration::from_secs(3);
    config
}

fn spawner(
    h: &Harness,
    handler: impl Handler + 'static,
    metrics: &Metrics,
    config: SpawnerConfig,
) -> WarmPoolSpawner {
    WarmPoolSpawner::new(
        h.dyn_queue(),
        Arc::new(HandlerRegistry::new().register(TaskKind::Execute, handler)),
        CircuitBreaker::new(3, Duration::from_secs(30)),
        metrics.clone(),
        patient_workers(),
        config,
    )
}

fn slow_echo(delay: Duration) -> impl Handler {
    handler_fn(move |task: Task| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, HandlerError>(Outcome::Done(task.payload))
    })
}

#[tokio::test]
async fn cycle_keeps_the_warm_pool_filled() {
    init_tracing();
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let mut spawner = spawner(&h, echo(), &metrics, spawner_config(2, 3));

    let report = spawner.cycle().await;
    assert_eq!(report.launched, 2);
    assert_eq!(report.live, 2);
    assert_eq!(report.idle, 2);
    assert_eq!(metrics.live_workers(), 2);

    let report = spawner.cycle().await;
    assert_eq!(report.launched, 0);
    assert_eq!(spawner.live_workers(), 2);

    h.submit(SubmissionBuilder::new("A").build()).await;
    assert_eq!(h.gateway.process_results(Duration::from_secs(3)).await.unwrap(), 1);

    let mut reaped = 0;
    with_timeout(async {
        while reaped == 0 {
            let report = spawner.cycle().await;
            assert!(report.live <= 3);
            reaped += report.reaped;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let report = spawner.cycle().await;
    assert_eq!(report.live, 2);
    assert_eq!(report.idle, 2);
}

#[tokio::test]
async fn busy_workers_count_against_max_workers() {
    init_tracing();
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let mut spawner = spawner(&h, hanging(), &metrics, spawner_config(2, 2));

    h.submit(SubmissionBuilder::new("A").build()).await;
    h.submit(SubmissionBuilder::new("B").build()).await;
    spawner.cycle().await;

    let report = with_timeout(async {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let report = spawner.cycle().await;
            if report.idle == 0 {
                break report;
            }
        }
    })
    .await;
    assert_eq!(report.launched, 0);
    assert_eq!(report.live, 2);
}

#[tokio::test]
async fn pending_gauge_counts_unserved_tasks_by_kind() {
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let mut spawner = spawner(&h, echo(), &metrics, spawner_config(1, 1));

    h.submit(SubmissionBuilder::new("A").requires("gpu").build()).await;
    let report = spawner.cycle().await;

    assert_eq!(report.pending, 1);
    assert_eq!(metrics.queue_pending("execute"), 1);
    assert_eq!(metrics.queue_pending("render"), 0);
}

#[tokio::test]
async fn cycle_requeues_orphans() {
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let mut config = spawner_config(1, 1);
    config.orphan_idle_threshold = Duration::ZERO;
    let mut spawner = spawner(&h, echo(), &metrics, config);

    h.submit(SubmissionBuilder::new("A").build()).await;
    h.queue
        .dequeue(&["default|".to_string()], Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();

    let report = spawner.cycle().await;
    assert_eq!(report.requeued, 1);
    assert_eq!(h.queue.in_flight_len(), 0);
}

#[tokio::test]
async fn shutdown_cancels_idle_workers() {
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let spawner = spawner(&h, echo(), &metrics, spawner_config(2, 4));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(spawner.run(rx));
    with_timeout(async {
        while metrics.live_workers() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    tx.send(true).unwrap();
    with_timeout(handle).await.unwrap();
    assert_eq!(metrics.live_workers(), 0);
}

#[tokio::test]
async fn zero_poll_interval_still_ticks() {
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let mut config = spawner_config(1, 2);
    config.poll_interval = Duration::ZERO;
    let spawner = spawner(&h, echo(), &metrics, config);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(spawner.run(rx));
    with_timeout(async {
        while metrics.live_workers() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    tx.send(true).unwrap();
    with_timeout(handle).await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_busy_workers_to_report() {
    init_tracing();
    let h = Harness::new();
    let metrics = Metrics::new().unwrap();
    let spawner = spawner(
        &h,
        slow_echo(Duration::from_millis(300)),
        &metrics,
        spawner_config(1, 1),
    );
    h.submit(SubmissionBuilder::new("A").build()).await;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(spawner.run(rx));
    tokio::time::sleep(Duration::from_millis(120)).await;

    tx.send(true).unwrap();
    with_timeout(handle).await.unwrap();

    let results = h.queue.range(keys::RESULTS, 0, -1).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(h.queue.in_flight_len(), 0);
}
