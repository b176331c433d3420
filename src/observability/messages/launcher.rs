// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct WorkerSpawned<'a> {
    pub worker_id: &'a str,
    pub task_id: &'a str,
    pub backend: &'a str,
}

impl fmt::Display for WorkerSpawned<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawned worker '{}' for task '{}' via {} backend",
            self.worker_id, self.task_id, self.backend
        )
    }
}

impl StructuredLog for WorkerSpawned<'_> {
    fn log(&self) {
        tracing::info!(
            worker_id = self.worker_id,
            task_id = self.task_id,
            backend = self.backend,
            "{}",
            self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("worker_spawned", span_name = name, worker_id = self.worker_id)
    }
}

pub struct WorkerExited<'a> {
    pub worker_id: &'a str,
    pub exit_code: Option<i32>,
}

impl fmt::Display for WorkerExited<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker '{}' exited with code {:?}",
            self.worker_id, self.exit_code
        )
    }
}

impl StructuredLog for WorkerExited<'_> {
    fn log(&self) {
        tracing::info!(worker_id = self.worker_id, exit_code = ?self.exit_code, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("worker_exited", span_name = name, worker_id = self.worker_id)
    }
}
