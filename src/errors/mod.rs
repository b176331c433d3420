// SPDX-License-Identifier: MIT

//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror`-derived enum; `OrchestratorError`
//! composes them with `#[from]` so call sites deep in the stack can just use
//! `?` and let the top level render whichever variant actually occurred.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task id: {task_id}")]
    DuplicateTaskId { task_id: String },

    #[error("task {task_id} depends on unknown task {missing_dependency}")]
    UnresolvedDependency {
        task_id: String,
        missing_dependency: String,
    },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("tasks {task_a} and {task_b} both create {path} within the same level")]
    FileOwnershipConflict {
        task_a: String,
        task_b: String,
        path: PathBuf,
    },

    #[error("unsupported task graph schema version: expected \"2.0\", found {found:?}")]
    UnsupportedVersion { found: String },

    #[error("document declares total_tasks={declared} but the graph has {actual} tasks")]
    TaskCountMismatch { declared: usize, actual: usize },

    #[error("task {task_id} declares level {declared} but derivation computed level {computed}")]
    LevelMismatch {
        task_id: String,
        declared: usize,
        computed: usize,
    },

    #[error("document levels{{}} for feature {feature} disagree with the derived levels")]
    LevelsMapMismatch { feature: String },

    #[error("failed to parse task graph document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read task graph file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state document is corrupt and no .bak copy is available: {0}")]
    Corrupt(String),

    #[error("failed to acquire state lock at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state sequence regressed: on-disk={on_disk} attempted={attempted}")]
    SequenceRegression { on_disk: u64, attempted: u64 },
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("worktree for worker {worker_id} already exists at {path}")]
    AlreadyExists { worker_id: String, path: PathBuf },

    #[error("no worktree found for worker {worker_id}")]
    NotFound { worker_id: String },

    #[error("refusing to prune worktree {path}: it has uncommitted changes")]
    DirtyWorktree { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container backend error for worker {worker_id}: {source}")]
    Container {
        worker_id: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("worker {worker_id} is not running")]
    NotRunning { worker_id: String },

    #[error("no launcher backend named {backend} is available")]
    UnknownBackend { backend: String },

    #[error("launcher backend {backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("task {task_id} exhausted its retry budget ({attempts} attempts)")]
    BudgetExhausted { task_id: String, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to spawn gate {gate_name}: {source}")]
    Spawn {
        gate_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compute fingerprint for {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("merge conflict integrating worker branch {branch} into {target}")]
    Conflict { branch: String, target: String },

    #[error("level {level} has no completed workers to merge")]
    NothingToMerge { level: usize },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("level {level} failed to complete")]
    LevelFailed { level: usize },
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
