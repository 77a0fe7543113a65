// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod errors;
pub mod integrity;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod spawner;
pub mod task;
pub mod types;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, PlanArgs, RunArgs};
use crate::config::loader::{load_and_validate, resolve_config_path};
use crate::config::model::ConfigFile;
use crate::dag::{immediate_dependencies, topological_sort, transitive_dependency_sort};
use crate::integrity::{
    ArtifactStore, FinalizedManifest, FsArtifactStore, ManifestWriter, TaskChainer,
};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::open_queue;
use crate::scheduler::{Gateway, MemoryRunStore, RunStore};
use crate::spawner::WarmPoolSpawner;
use crate::task::TaskRun;
use crate::types::{TaskKind, TaskStatus};
use crate::worker::{CommandHandler, HandlerRegistry};

/// File under the manifest dir holding the persisted chain head.
pub const CHAIN_HEAD_FILE: &str = "chain.head";

/// How long one result wait blocks before the settle check runs again.
const RESULT_POLL: Duration = Duration::from_millis(200);

const MANIFEST_CHANNEL_CAPACITY: usize = 256;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Run(run_args) => run_command(&run_args).await,
        Command::Plan(plan_args) => plan_command(&plan_args),
    }
}

async fn run_command(args: &RunArgs) -> Result<()> {
    let cfg = load_and_validate(resolve_config_path(args.config.as_deref()))?;

    // Ctrl-C → graceful shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = run_config(&cfg, shutdown_rx).await?;
    print_summary(&cfg, &summary);

    if summary.interrupted {
        bail!("interrupted before every task settled");
    }
    let unsuccessful = summary.count_not(TaskStatus::Success);
    if unsuccessful > 0 {
        bail!("{unsuccessful} task(s) did not succeed");
    }
    Ok(())
}

/// Everything a local run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final state of every submitted run, in submission order.
    pub runs: Vec<TaskRun>,
    pub chain_head: String,
    pub manifest: FinalizedManifest,
    pub metrics: MetricsSnapshot,
    /// `true` when shutdown was requested before the runs settled.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.runs.iter().find(|r| r.id == id).map(|r| r.status)
    }

    fn count_not(&self, status: TaskStatus) -> usize {
        self.runs.iter().filter(|r| r.status != status).count()
    }
}

/// Run every configured task in-process until all runs settle or
/// `shutdown` flips to `true`.
///
/// Wires an in-memory queue and run store, a chain whose head lives under
/// the manifest dir, the manifest writer, the gateway and a warm-pool
/// spawner whose workers run `execute` tasks as shell commands.
pub async fn run_config(cfg: &ConfigFile, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
    let queue = open_queue(&cfg.queue.address)?;
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());

    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(cfg.manifest.dir.join("artifacts")));
    let writer = ManifestWriter::start(
        &cfg.manifest.dir,
        cfg.manifest.name.clone(),
        artifacts,
        MANIFEST_CHANNEL_CAPACITY,
    )
    .await?;
    let chainer = TaskChainer::resume(cfg.manifest.dir.join(CHAIN_HEAD_FILE))?;

    let gateway = Gateway::new(Arc::clone(&queue), store, chainer)
        .with_manifest(writer.handle())
        .with_task_ttl(cfg.queue.task_ttl);

    let metrics = Metrics::new()?;
    let registry = Arc::new(HandlerRegistry::new().register(TaskKind::Execute, CommandHandler));
    let spawner = WarmPoolSpawner::new(
        Arc::clone(&queue),
        registry,
        cfg.circuit_breaker(),
        metrics.clone(),
        cfg.worker_config(),
        cfg.spawner_config(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let spawner_task = tokio::spawn(spawner.run(stop_rx));

    let tenant = cfg.manifest.tenant.as_str();
    let mut ids = Vec::with_capacity(cfg.task.len());
    for submission in cfg.submissions()? {
        let outcome = gateway.submit(tenant, submission).await?;
        info!(
            task = %outcome.run.id,
            created = outcome.created,
            status = %outcome.run.status,
            "submitted task"
        );
        ids.push(outcome.run.id);
    }

    let interrupted = wait_until_settled(&gateway, &mut shutdown).await?;

    let _ = stop_tx.send(true);
    if let Err(e) = spawner_task.await {
        warn!(error = %e, "spawner task failed");
    }
    // Busy workers finish before the spawner stops; fold in what they reported.
    gateway.process_results(Duration::ZERO).await?;

    let mut runs = Vec::with_capacity(ids.len());
    for id in &ids {
        runs.push(gateway.get(id)?);
    }
    let chain_head = gateway.chain_head();
    drop(gateway);

    let manifest = writer.finalize().await?;
    info!(
        path = %manifest.path.display(),
        records = manifest.count,
        "manifest finalized"
    );

    Ok(RunSummary {
        runs,
        chain_head,
        manifest,
        metrics: metrics.snapshot(),
        interrupted,
    })
}

/// Process results until the gateway is settled. Returns `true` if
/// shutdown was requested first.
async fn wait_until_settled(gateway: &Gateway, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
    let mut listening = true;
    loop {
        if *shutdown.borrow() {
            return Ok(true);
        }
        if gateway.is_settled()? {
            return Ok(false);
        }
        tokio::select! {
            handled = gateway.process_results(RESULT_POLL) => {
                let handled = handled?;
                if handled > 0 {
                    debug!(handled, "processed results");
                }
            }
            changed = shutdown.changed(), if listening => {
                if changed.is_err() {
                    listening = false;
                }
            }
        }
    }
}

fn print_summary(cfg: &ConfigFile, summary: &RunSummary) {
    println!("workdag run summary");
    println!("  tenant: {}", cfg.manifest.tenant);
    println!("  tasks ({}):", summary.runs.len());
    for run in &summary.runs {
        match &run.error {
            Some(err) if run.status == TaskStatus::Failed => {
                println!("    - {}: {} ({})", run.id, run.status, err)
            }
            _ => println!("    - {}: {}", run.id, run.status),
        }
    }
    println!("  chain head: {}", summary.chain_head);
    println!(
        "  manifest: {} ({} records) -> {}",
        summary.manifest.path.display(),
        summary.manifest.count,
        summary.manifest.location
    );
    if summary.interrupted {
        println!("  interrupted: true");
    }
}

/// One line of `workdag plan` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: String,
    pub kind: TaskKind,
    pub after: Vec<String>,
    pub cmd: Option<String>,
}

/// Submission order of the configured tasks, optionally limited to the
/// tasks `from` transitively depends on.
pub fn plan(cfg: &ConfigFile, from: Option<&str>) -> crate::errors::Result<Vec<PlanEntry>> {
    let records = cfg.task_records();
    let order = match from {
        Some(name) => transitive_dependency_sort(&records, name)?,
        None => topological_sort(&records)?,
    };

    let mut entries = Vec::with_capacity(order.len());
    for record in order {
        let Some(task) = cfg.task.get(&record.id) else {
            continue;
        };
        entries.push(PlanEntry {
            name: record.id.clone(),
            kind: task.kind,
            after: immediate_dependencies(&records, &record.id)?,
            cmd: task.cmd.clone(),
        });
    }
    Ok(entries)
}

fn plan_command(args: &PlanArgs) -> Result<()> {
    let cfg = load_and_validate(resolve_config_path(args.config.as_deref()))?;
    let entries = plan(&cfg, args.from.as_deref())?;

    println!("workdag plan");
    println!("  tasks ({}):", entries.len());
    for (i, entry) in entries.iter().enumerate() {
        println!("  {}. {} [{}]", i + 1, entry.name, entry.kind);
        if let Some(cmd) = &entry.cmd {
            println!("      cmd: {cmd}");
        }
        if !entry.after.is_empty() {
            println!("      after: {}", entry.after.join(", "));
        }
    }

    debug!("plan complete (no execution)");
    Ok(())
}
