// SPDX-License-Identifier: MIT

//! Operator-facing driver binary. Wires the task graph, configuration,
//! launcher backend, and `LevelController` together the way the teacher's
//! `main.rs` wires `config`, `engine`, and its processor registry — one
//! level up: this binary only parses arguments and dispatches, all real
//! work happens in the library crate.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mahabharatha::config::{self, OrchestratorConfig};
use mahabharatha::errors::OrchestratorError;
use mahabharatha::graph::TaskGraph;
use mahabharatha::launcher::launcher_for_backend;
use mahabharatha::level_controller::LevelController;
use mahabharatha::state::{EscalationStore, FeatureState, StateStore, TaskStatus};
use mahabharatha::worktree::WorktreeManager;

#[derive(Parser)]
#[command(name = "mahabharatha", about = "Level-by-level multi-agent task orchestrator")]
struct Cli {
    /// Path to orchestrator.yaml. Falls back to built-in defaults if absent.
    #[arg(long, global = true, default_value = "orchestrator.yaml")]
    config: PathBuf,

    /// Repository root the task graph, worktrees, and state live under.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the task graph and drive every level to completion.
    Run {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        feature: String,
    },
    /// Render level/task/worker status for a feature, read-only.
    Status {
        #[arg(long)]
        feature: String,
    },
    /// Clear a blocked task back to pending so it is re-admitted on the
    /// next scheduling pass. Refuses if an unresolved escalation remains.
    Retry {
        #[arg(long)]
        feature: String,
        #[arg(long)]
        task: String,
    },
    /// Operator override: mark a blocked task completed with a skip
    /// annotation (spec §4.7's "skipped by operator decision" path).
    Unblock {
        #[arg(long)]
        feature: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        skip: bool,
    },
    /// Prune worker worktrees and archive task logs for a feature.
    Cleanup {
        #[arg(long)]
        feature: String,
        #[arg(long)]
        force: bool,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn load_config(path: &PathBuf) -> OrchestratorConfig {
    if path.exists() {
        match config::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("failed to parse {}: {err}", path.display());
                std::process::exit(1);
            }
        }
    } else {
        OrchestratorConfig::default()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { graph, feature } => run_feature(&cli.repo, &cli.config, &graph, &feature).await,
        Command::Status { feature } => show_status(&cli.repo, &feature),
        Command::Retry { feature, task } => retry_task(&cli.repo, &feature, &task),
        Command::Unblock { feature, task, skip } => unblock_task(&cli.repo, &feature, &task, skip),
        Command::Cleanup { feature, force } => cleanup_feature(&cli.repo, &feature, force),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_feature(
    repo: &PathBuf,
    config_path: &PathBuf,
    graph_path: &PathBuf,
    feature: &str,
) -> Result<(), OrchestratorError> {
    let cfg = load_config(config_path);
    let graph = TaskGraph::load(graph_path)?;
    let launcher = launcher_for_backend(&cfg.launcher.backend, repo, &cfg.launcher.worker_image)
        .await
        .map_err(OrchestratorError::Launch)?;

    let mut controller =
        LevelController::new(&graph, feature, repo.clone(), graph_path.clone(), launcher, &cfg);
    controller.run().await
}

fn show_status(repo: &PathBuf, feature: &str) -> Result<(), OrchestratorError> {
    let state_dir = StateStore::default_dir(repo);
    let store = StateStore::new(state_dir, feature);
    let state = store.load_or_init()?;

    println!("feature: {}", state.feature);
    println!("current level: {}", state.current_level);
    for level in &state.levels {
        println!("  level {} [{:?}]", level.index, level.status);
        for task_id in &level.task_ids {
            if let Some(task) = state.tasks.get(task_id) {
                println!(
                    "    {task_id}: {:?} (attempts={}, worker={:?})",
                    task.status, task.attempts, task.worker_id
                );
            }
        }
    }
    Ok(())
}

fn retry_task(repo: &PathBuf, feature: &str, task_id: &str) -> Result<(), OrchestratorError> {
    let state_dir = StateStore::default_dir(repo);
    let store = StateStore::new(state_dir.clone(), feature);
    let escalations = EscalationStore::new(state_dir, feature);

    let outstanding: Vec<_> = escalations
        .unresolved()?
        .into_iter()
        .filter(|e| e.task_id == task_id)
        .collect();
    if !outstanding.is_empty() {
        return Err(OrchestratorError::Config(format!(
            "task {task_id} has an unresolved escalation; resolve it before retrying"
        )));
    }

    store.modify(|state| {
        if let Some(record) = state.tasks.get_mut(task_id) {
            record.status = TaskStatus::Pending;
            record.worker_id = None;
        }
        state.record_event(format!("task {task_id} reset to pending by operator retry"));
    })?;
    Ok(())
}

fn unblock_task(repo: &PathBuf, feature: &str, task_id: &str, skip: bool) -> Result<(), OrchestratorError> {
    let state_dir = StateStore::default_dir(repo);
    let store = StateStore::new(state_dir.clone(), feature);
    let escalations = EscalationStore::new(state_dir, feature);

    store.modify(|state| {
        if let Some(record) = state.tasks.get_mut(task_id) {
            record.status = TaskStatus::Completed;
            record.skipped_by_operator = skip;
        }
        state.record_event(format!("task {task_id} unblocked by operator (skip={skip})"));
    })?;
    escalations.resolve_for_task(task_id)?;
    Ok(())
}

fn cleanup_feature(repo: &PathBuf, feature: &str, force: bool) -> Result<(), OrchestratorError> {
    let state_dir = StateStore::default_dir(repo);
    let store = StateStore::new(state_dir, feature);
    let state = store.load_or_init()?;
    let worktrees = WorktreeManager::new(repo.clone());

    archive_task_logs(repo, feature, &state)?;

    for worker in state.workers.values() {
        match worktrees.prune_worker_worktree(feature, &worker.worker_id, force) {
            Ok(()) => {}
            Err(err) => eprintln!("skipping worker {}: {err}", worker.worker_id),
        }
    }
    Ok(())
}

/// Move this feature's worker/gate logs out of `.mahabharatha/logs/` into
/// the `archive/<feature>/` layout (spec §6). Renaming (not copying) makes
/// a repeated cleanup on an already-archived feature a no-op: there's
/// nothing left under `logs/` with a matching name to move.
fn archive_task_logs(repo: &Path, feature: &str, state: &FeatureState) -> Result<(), OrchestratorError> {
    let logs_dir = repo.join(".mahabharatha").join("logs");
    if !logs_dir.exists() {
        return Ok(());
    }

    let archive_dir = repo.join("archive").join(feature);
    fs::create_dir_all(&archive_dir)
        .map_err(|e| OrchestratorError::Config(format!("creating {}: {e}", archive_dir.display())))?;

    let mut log_names: Vec<String> = state.workers.keys().map(|worker_id| format!("{worker_id}.log")).collect();
    for gate_result in state.gate_cache.values() {
        if let Some(name) = Path::new(&gate_result.log_path).file_name() {
            log_names.push(name.to_string_lossy().into_owned());
        }
    }

    for name in log_names {
        let src = logs_dir.join(&name);
        if !src.exists() {
            continue;
        }
        let dest = archive_dir.join(&name);
        fs::rename(&src, &dest).map_err(|e| OrchestratorError::Config(format!("archiving {}: {e}", src.display())))?;
    }
    Ok(())
}
