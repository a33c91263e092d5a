//! Demo CLI for the task coordinator
//!
//! `run` drives a goal through the built-in split decomposer and echo
//! executor; `inspect` dumps the task table of an existing session db.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use coordinator::config::CoordinatorConfig;
use coordinator::executors::{EchoExecutor, ReportSynthesizer, SplitDecomposer};
use coordinator::locks::LockManager;
use coordinator::mailbox::Mailbox;
use coordinator::store::{SessionDb, TaskStore};
use coordinator::supervisor::Supervisor;
use coordinator_sdk::RunId;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "coordinator", about = "Dependency-aware multi-agent task coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a goal through the demo decomposer and executor
    Run {
        /// Goal text; steps separated by ';'
        #[arg(long)]
        goal: String,
        /// YAML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,
        /// Treat steps as independent instead of a pipeline
        #[arg(long)]
        parallel: bool,
        /// Session database path (defaults under ~/.task-coordinator)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print the task table of a session database
    Inspect {
        /// Session database path
        #[arg(long)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            goal,
            config,
            workers,
            parallel,
            db,
        } => run_goal(goal, config, workers, parallel, db).await,
        Command::Inspect { db } => inspect(db),
    }
}

async fn run_goal(
    goal: String,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    parallel: bool,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => CoordinatorConfig::from_yaml_file(&path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(path) = db_path {
        config.db_path = Some(path);
    }
    config.validate()?;

    let run_id = RunId::new();
    let db = Arc::new(SessionDb::open(config.session_db_path(run_id))?);
    let store = Arc::new(TaskStore::new(db.clone()));
    let mailbox = Arc::new(Mailbox::new(db.clone()));
    let locks = Arc::new(LockManager::new(db));

    let supervisor = Supervisor::new(
        store,
        mailbox,
        locks,
        Arc::new(SplitDecomposer::new(!parallel)),
        Arc::new(EchoExecutor::new(Duration::from_millis(50))),
        Arc::new(ReportSynthesizer),
        config,
    );

    let report = supervisor.run(&goal).await?;

    println!(
        "run {} finished: {} ({} complete, {} failed)",
        report.run_id, report.outcome, report.completed, report.failed
    );
    for objective in &report.unmet_objectives {
        println!("  unmet: {}", objective);
    }
    println!("{}", serde_json::to_string_pretty(&report.report)?);

    Ok(())
}

fn inspect(db_path: PathBuf) -> Result<()> {
    let db = Arc::new(SessionDb::open(db_path).context("Failed to open session db")?);
    let store = TaskStore::new(db);

    let snapshot = store.snapshot()?;
    if snapshot.tasks.is_empty() {
        println!("no tasks recorded");
        return Ok(());
    }

    for task in &snapshot.tasks {
        println!(
            "#{:<4} {:<10} {:<12} deps={:?} {}",
            task.task_id,
            task.status,
            task.assigned_to.as_deref().unwrap_or("-"),
            task.dependencies,
            task.description
        );
    }
    println!("archived rows: {}", store.archived_count()?);

    Ok(())
}
