// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct LevelMergeStarted {
    pub level: usize,
    pub branch_count: usize,
}

impl fmt::Display for LevelMergeStarted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merging {} worker branches for level {}",
            self.branch_count, self.level
        )
    }
}

impl StructuredLog for LevelMergeStarted {
    fn log(&self) {
        tracing::info!(level = self.level, branch_count = self.branch_count, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("level_merge_started", span_name = name, level = self.level)
    }
}

pub struct GateRan<'a> {
    pub gate_name: &'a str,
    pub passed: bool,
    pub cached: bool,
}

impl fmt::Display for GateRan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "passed" } else { "failed" };
        let source = if self.cached { "cache" } else { "run" };
        write!(f, "gate '{}' {verdict} (from {source})", self.gate_name)
    }
}

impl StructuredLog for GateRan<'_> {
    fn log(&self) {
        if self.passed {
            tracing::info!(gate = self.gate_name, cached = self.cached, "{}", self);
        } else {
            tracing::error!(gate = self.gate_name, cached = self.cached, "{}", self);
        }
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("gate_ran", span_name = name, gate = self.gate_name)
    }
}

pub struct LevelRolledBack {
    pub level: usize,
    pub reason: String,
}

impl fmt::Display for LevelRolledBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rolled back level {}: {}", self.level, self.reason)
    }
}

impl StructuredLog for LevelRolledBack {
    fn log(&self) {
        tracing::error!(level = self.level, reason = %self.reason, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!("level_rolled_back", span_name = name, level = self.level)
    }
}
