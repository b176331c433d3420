// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct GraphLoaded<'a> {
    pub feature: &'a str,
    pub task_count: usize,
    pub level_count: usize,
}

impl fmt::Display for GraphLoaded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loaded task graph for '{}': {} tasks across {} levels",
            self.feature, self.task_count, self.level_count
        )
    }
}

impl StructuredLog for GraphLoaded<'_> {
    fn log(&self) {
        tracing::info!(
            feature = self.feature,
            task_count = self.task_count,
            level_count = self.level_count,
            "{}",
            self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("graph_loaded", span_name = name, feature = self.feature)
    }
}

pub struct CycleDetected<'a> {
    pub feature: &'a str,
    pub cycle: &'a [String],
}

impl fmt::Display for CycleDetected<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependency cycle in '{}': {}",
            self.feature,
            self.cycle.join(" -> ")
        )
    }
}

impl StructuredLog for CycleDetected<'_> {
    fn log(&self) {
        tracing::error!(feature = self.feature, cycle = ?self.cycle, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!("cycle_detected", span_name = name, feature = self.feature)
    }
}

pub struct FileOwnershipConflict<'a> {
    pub task_a: &'a str,
    pub task_b: &'a str,
    pub path: &'a str,
}

impl fmt::Display for FileOwnershipConflict<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tasks '{}' and '{}' both claim {} within the same level",
            self.task_a, self.task_b, self.path
        )
    }
}

impl StructuredLog for FileOwnershipConflict<'_> {
    fn log(&self) {
        tracing::error!(
            task_a = self.task_a,
            task_b = self.task_b,
            path = self.path,
            "{}",
            self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!("file_ownership_conflict", span_name = name)
    }
}
