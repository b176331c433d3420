// SPDX-License-Identifier: MIT

pub mod container;
pub mod process;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::errors::LaunchError;

/// Outcome of a worker that has finished running, as distinguished by the
/// checkpoint/resume protocol in spec §4.4: exit code 2 is a cooperative
/// pause after a WIP commit, 0 is success, anything else is a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded,
    Checkpointed,
    Crashed { exit_code: Option<i32> },
}

impl WorkerOutcome {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => WorkerOutcome::Succeeded,
            Some(2) => WorkerOutcome::Checkpointed,
            other => WorkerOutcome::Crashed { exit_code: other },
        }
    }
}

/// A worker backend: process or container. One instance is spawned per
/// worker; the launcher owns polling its liveness and retrieving output
/// once it exits. Mirrors the teacher's `DagExecutor` async_trait shape,
/// generalized from "execute a DAG" to "run one opaque worker".
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the worker for `worker_id` inside `worktree_path`, bound to
    /// `branch`. The worker launch contract (spec §6) guarantees `WORKER_ID`,
    /// `FEATURE`, and `BRANCH` are set from these parameters; `env` carries
    /// everything else the caller promises (at minimum `STATE_DIR`).
    /// Returns a backend-specific handle id (pid or container id) used for
    /// subsequent polls/signals.
    async fn spawn(
        &self,
        worker_id: &str,
        feature: &str,
        worktree_path: &Path,
        branch: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, LaunchError>;

    /// Non-blocking poll: `None` while still running, `Some(outcome)` once
    /// the worker has exited.
    async fn poll(&self, worker_id: &str, handle: &str) -> Result<Option<WorkerOutcome>, LaunchError>;

    /// Send a graceful termination signal (SIGTERM / container stop).
    async fn terminate(&self, worker_id: &str, handle: &str) -> Result<(), LaunchError>;

    /// Hard kill for a worker that ignored `terminate`.
    async fn kill(&self, worker_id: &str, handle: &str) -> Result<(), LaunchError>;

    /// Retrieve captured stdout/stderr for diagnostics and escalation
    /// reports.
    async fn output(&self, worker_id: &str, handle: &str) -> Result<String, LaunchError>;

    fn backend_name(&self) -> &'static str;
}

/// Selects a launcher backend the way the teacher's `ExecutorFactory`
/// selects an executor strategy from config, generalized with one addition
/// spec §4.4 requires that the teacher's factory never needed: `"auto"`
/// probes for a usable container runtime before falling back to a plain
/// process, rather than erroring on an unrecognized name.
pub async fn launcher_for_backend(
    backend: &str,
    repo_root: &Path,
    worker_image: &str,
) -> Result<Box<dyn Launcher>, LaunchError> {
    match backend {
        "process" => Ok(Box::new(process::ProcessLauncher::new())),
        "container" => Ok(Box::new(container::ContainerLauncher::connect(worker_image).await?)),
        "auto" => Ok(resolve_auto_backend(repo_root, worker_image).await?),
        other => Err(LaunchError::UnknownBackend {
            backend: other.to_string(),
        }),
    }
}

/// Prefers the container backend when a devcontainer is declared and the
/// runtime is actually reachable with the worker image present locally;
/// falls back to the process backend otherwise. Never errors on its own —
/// `"auto"` means "do the best available thing", not "require a container".
async fn resolve_auto_backend(repo_root: &Path, worker_image: &str) -> Result<Box<dyn Launcher>, LaunchError> {
    if !repo_root.join(".devcontainer").exists() {
        return Ok(Box::new(process::ProcessLauncher::new()));
    }

    let launcher = match container::ContainerLauncher::connect(worker_image).await {
        Ok(launcher) => launcher,
        Err(_) => return Ok(Box::new(process::ProcessLauncher::new())),
    };

    if launcher.is_available().await && launcher.has_image(worker_image).await {
        Ok(Box::new(launcher))
    } else {
        Ok(Box::new(process::ProcessLauncher::new()))
    }
}
