#![cfg(unix)]

mod common;

use common::builders::{ConfigFileBuilder, TaskConfigBuilder};
use common::{init_tracing, with_timeout, with_timeout_of};
use std::time::Duration;
use tokio::sync::watch;
use workdag::types::{TaskKind, TaskStatus};
use workdag::{CHAIN_HEAD_FILE, plan, run_config};

fn pipeline(dir: &std::path::Path) -> ConfigFileBuilder {
    ConfigFileBuilder::new()
        .manifest_dir(dir)
        .tenant("ci")
        .with_task("build", TaskConfigBuilder::new("echo built").build())
        .with_task(
            "test",
            TaskConfigBuilder::new("test 1 -eq 1").after("build").build(),
        )
        .with_task("broken", TaskConfigBuilder::new("exit 3").build())
        .with_task(
            "downstream",
            TaskConfigBuilder::new("echo never").after("broken").build(),
        )
        .with_task(
            "gated",
            TaskConfigBuilder::new("echo gated")
                .after("build")
                .edge_pred("build.exit_code == 1")
                .build(),
        )
}

#[tokio::test]
async fn configured_pipeline_runs_to_a_settled_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = pipeline(dir.path()).build();

    let (_tx, rx) = watch::channel(false);
    let summary = with_timeout_of(Duration::from_secs(20), run_config(&cfg, rx))
        .await
        .unwrap();

    assert!(!summary.interrupted);
    assert_eq!(summary.runs.len(), 5);
    assert_eq!(summary.status_of("build"), Some(TaskStatus::Success));
    assert_eq!(summary.status_of("test"), Some(TaskStatus::Success));
    assert_eq!(summary.status_of("broken"), Some(TaskStatus::Failed));
    assert_eq!(summary.status_of("downstream"), Some(TaskStatus::Waiting));
    assert_eq!(summary.status_of("gated"), Some(TaskStatus::Waiting));

    let broken = summary.runs.iter().find(|r| r.id == "broken").unwrap();
    assert!(broken.error.as_deref().unwrap().contains("status 3"));
    assert!(summary.runs.iter().all(|r| r.tenant == "ci"));

    assert_eq!(summary.manifest.count, 3);
    assert!(summary.manifest.path.exists());
    assert!(dir.path().join("artifacts").join("manifest.json").exists());

    let head = std::fs::read_to_string(dir.path().join(CHAIN_HEAD_FILE)).unwrap();
    assert_eq!(head.trim(), summary.chain_head);

    let executed: u64 = summary.metrics.worker_task_total.values().sum();
    assert_eq!(executed, 3);
}

#[tokio::test]
async fn a_second_run_extends_the_persisted_chain() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ConfigFileBuilder::new()
        .manifest_dir(dir.path())
        .with_task("only", TaskConfigBuilder::new("true").build())
        .build();

    let (_tx, rx) = watch::channel(false);
    let first = with_timeout_of(Duration::from_secs(20), run_config(&cfg, rx.clone()))
        .await
        .unwrap();
    let second = with_timeout_of(Duration::from_secs(20), run_config(&cfg, rx))
        .await
        .unwrap();

    assert_eq!(first.status_of("only"), Some(TaskStatus::Success));
    assert_eq!(second.status_of("only"), Some(TaskStatus::Success));
    assert_ne!(first.chain_head, second.chain_head);
}

#[tokio::test]
async fn shutdown_request_interrupts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ConfigFileBuilder::new()
        .manifest_dir(dir.path())
        .task_timeout("1s")
        .with_task("slow", TaskConfigBuilder::new("sleep 3").build())
        .build();

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let summary = with_timeout(run_config(&cfg, rx)).await.unwrap();

    assert!(summary.interrupted);
    assert_ne!(summary.status_of("slow"), Some(TaskStatus::Success));
    assert!(summary.manifest.path.exists());
}

#[test]
fn plan_lists_tasks_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = pipeline(dir.path()).build();

    let entries = plan(&cfg, None).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names.len(), 5);
    let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
    assert!(pos("build") < pos("test"));
    assert!(pos("build") < pos("gated"));
    assert!(pos("broken") < pos("downstream"));

    let test = entries.iter().find(|e| e.name == "test").unwrap();
    assert_eq!(test.after, vec!["build".to_string()]);
    assert_eq!(test.kind, TaskKind::Execute);
    assert_eq!(test.cmd.as_deref(), Some("test 1 -eq 1"));
}

#[test]
fn plan_from_limits_to_the_dependency_chain() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = pipeline(dir.path()).build();

    let entries = plan(&cfg, Some("test")).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["build", "test"]);

    assert!(plan(&cfg, Some("nope")).is_err());
}
