// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct TaskDispatched<'a> {
    pub task_id: &'a str,
    pub worker_id: &'a str,
    pub level: usize,
}

impl fmt::Display for TaskDispatched<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched task '{}' to worker '{}' (level {})",
            self.task_id, self.worker_id, self.level
        )
    }
}

impl StructuredLog for TaskDispatched<'_> {
    fn log(&self) {
        tracing::info!(
            task_id = self.task_id,
            worker_id = self.worker_id,
            level = self.level,
            "{}",
            self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("task_dispatched", span_name = name, task_id = self.task_id)
    }
}

pub struct LevelReady<'a> {
    pub level: usize,
    pub ready_task_ids: &'a [String],
}

impl fmt::Display for LevelReady<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "level {} has {} ready tasks",
            self.level,
            self.ready_task_ids.len()
        )
    }
}

impl StructuredLog for LevelReady<'_> {
    fn log(&self) {
        tracing::info!(level = self.level, ready = ?self.ready_task_ids, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("level_ready", span_name = name, level = self.level)
    }
}
