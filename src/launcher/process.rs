// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::errors::LaunchError;
use crate::launcher::{Launcher, WorkerOutcome};
use crate::observability::messages::launcher::{WorkerExited, WorkerSpawned};
use crate::observability::messages::StructuredLog;

/// Runs a worker as a plain OS subprocess via `tokio::process`. The handle
/// returned from `spawn` is the child's pid as a string; children are kept
/// alive in-process (not re-attached from a pid across restarts) since a
/// crashed orchestrator simply re-dispatches the task to a fresh worker.
pub struct ProcessLauncher {
    children: Arc<Mutex<HashMap<String, Child>>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn(
        &self,
        worker_id: &str,
        feature: &str,
        worktree_path: &Path,
        branch: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, LaunchError> {
        let child = Command::new("mahabharatha-worker")
            .current_dir(worktree_path)
            .env("WORKER_ID", worker_id)
            .env("FEATURE", feature)
            .env("BRANCH", branch)
            .envs(env)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                worker_id: worker_id.to_string(),
                source,
            })?;

        let pid = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        self.children.lock().await.insert(worker_id.to_string(), child);

        WorkerSpawned {
            worker_id,
            task_id: worker_id,
            backend: "process",
        }
        .log();

        Ok(pid)
    }

    async fn poll(&self, worker_id: &str, _handle: &str) -> Result<Option<WorkerOutcome>, LaunchError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(worker_id) else {
            return Err(LaunchError::NotRunning {
                worker_id: worker_id.to_string(),
            });
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let outcome = WorkerOutcome::from_exit_code(status.code());
                WorkerExited {
                    worker_id,
                    exit_code: status.code(),
                }
                .log();
                children.remove(worker_id);
                Ok(Some(outcome))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(LaunchError::Spawn {
                worker_id: worker_id.to_string(),
                source,
            }),
        }
    }

    async fn terminate(&self, worker_id: &str, _handle: &str) -> Result<(), LaunchError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(worker_id) {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        Ok(())
    }

    async fn kill(&self, worker_id: &str, _handle: &str) -> Result<(), LaunchError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(worker_id) {
            let _ = child.start_kill();
        }
        children.remove(worker_id);
        Ok(())
    }

    async fn output(&self, worker_id: &str, _handle: &str) -> Result<String, LaunchError> {
        // stdout/stderr are captured to the worker's log file in the
        // worktree rather than buffered in memory; the orchestrator reads
        // that file path when a report is needed.
        Ok(format!(".mahabharatha/logs/{worker_id}.log"))
    }

    fn backend_name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_cleanly_when_the_worker_binary_is_missing() {
        let launcher = ProcessLauncher::new();
        let dir = tempfile::tempdir().unwrap();
        let err = launcher
            .spawn("w1", "widget-export", dir.path(), "mahabharatha/widget-export/worker-w1", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn poll_errors_for_a_worker_that_was_never_spawned() {
        let launcher = ProcessLauncher::new();
        let err = launcher.poll("ghost", "123").await.unwrap_err();
        assert!(matches!(err, LaunchError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn terminate_and_kill_are_no_ops_for_an_unknown_worker() {
        let launcher = ProcessLauncher::new();
        assert!(launcher.terminate("ghost", "123").await.is_ok());
        assert!(launcher.kill("ghost", "123").await.is_ok());
    }

    #[tokio::test]
    async fn output_returns_the_worker_log_path() {
        let launcher = ProcessLauncher::new();
        let path = launcher.output("w1", "123").await.unwrap();
        assert_eq!(path, ".mahabharatha/logs/w1.log");
    }
}
