// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-task acceptance check (spec §3 `verification.{command,timeout_seconds}`),
/// run by the orchestrator once a worker reports success and before the task
/// is counted `completed` — distinct from the level-boundary Gate Pipeline,
/// which runs once per merge rather than once per task.
fn default_verification_timeout_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_verification_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// File-ownership declaration for a task (spec §6 `files.{create,modify,read}`).
/// `read` is shared and never checked for exclusivity; `create`/`modify` are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFiles {
    #[serde(default)]
    pub create: Vec<PathBuf>,
    #[serde(default)]
    pub modify: Vec<PathBuf>,
    #[serde(default)]
    pub read: Vec<PathBuf>,
}

/// A single unit of work assigned to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: TaskFiles,
    /// Absent means the task has no acceptance check beyond the worker's own
    /// exit code — it is counted `completed` as soon as the worker succeeds.
    #[serde(default)]
    pub verification: Option<Verification>,
    /// Redundant with derivation; if present, checked for consistency against
    /// the computed level rather than trusted (spec §4.1/§6).
    #[serde(default)]
    pub level: Option<usize>,
    /// Downstream task ids that consume this task's output; carried through
    /// for escalation/diagnostic reporting (spec §3), never read by core
    /// scheduling logic.
    #[serde(default)]
    pub consumers: Vec<String>,
    /// Path to a cross-task integration test, if this task has one (spec §3).
    /// Opaque to the core; surfaced to the gate pipeline by configuration,
    /// not read directly here.
    #[serde(default)]
    pub integration_test: Option<PathBuf>,
    /// Opaque per-task context blob passed through to the worker untouched.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Schema version this loader accepts (spec §6: `version` is the literal
/// string `"2.0"`).
pub const TASK_GRAPH_SCHEMA_VERSION: &str = "2.0";

/// The document on disk describing a feature's full set of tasks and the
/// dependency edges between them. `levels` is the author's own claim about
/// level assignment, if supplied; it is validated against the derived
/// levels rather than trusted (spec §6, §9 "levels are derived, not
/// authored"). Unknown top-level fields are preserved by serde's default
/// behavior of simply ignoring them, matching "unknown fields are preserved
/// but ignored".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraphDocument {
    pub feature: String,
    pub version: String,
    pub total_tasks: usize,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub levels: HashMap<String, Vec<String>>,
}

/// Forward dependency map: task id -> ids of tasks that depend on it.
///
/// Mirrors `DependencyGraph(pub HashMap<String, Vec<String>>)` from the
/// dependency-graph reference this module is ported from.
#[derive(Debug, Clone, Default)]
pub struct DependencyMap(pub HashMap<String, Vec<String>>);

impl DependencyMap {
    pub fn build_reverse(&self, all_ids: impl Iterator<Item = String>) -> HashMap<String, Vec<String>> {
        let mut reverse: HashMap<String, Vec<String>> =
            all_ids.map(|id| (id, Vec::new())).collect();
        for (task_id, dependents) in &self.0 {
            for dependent in dependents {
                reverse.entry(dependent.clone()).or_default().push(task_id.clone());
            }
        }
        reverse
    }
}

/// One topologically-ordered group of tasks whose dependencies are all
/// satisfied by earlier levels. All tasks in a level may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub index: usize,
    pub task_ids: Vec<String>,
}

/// A fully loaded and validated task graph ready for scheduling.
pub struct TaskGraph {
    pub feature: String,
    pub tasks: HashMap<String, Task>,
    pub forward: DependencyMap,
    pub levels: Vec<Level>,
}

impl TaskGraph {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn level_of(&self, task_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .find(|level| level.task_ids.iter().any(|id| id == task_id))
            .map(|level| level.index)
    }

    /// Every pending task in `level` whose dependencies are all present in
    /// `completed`.
    pub fn ready_set(&self, level: usize, completed: &std::collections::HashSet<String>) -> Vec<String> {
        let Some(level) = self.levels.get(level) else {
            return Vec::new();
        };
        level
            .task_ids
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| t.dependencies.iter().all(|dep| completed.contains(dep)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Longest chain of dependents below `task_id`, used by the scheduler's
    /// tie-break rule when more workers are idle than tasks are ready.
    pub fn critical_path_length(&self, task_id: &str) -> usize {
        fn walk(graph: &TaskGraph, id: &str, memo: &mut HashMap<String, usize>) -> usize {
            if let Some(cached) = memo.get(id) {
                return *cached;
            }
            let dependents = graph.forward.0.get(id).cloned().unwrap_or_default();
            let longest = dependents
                .iter()
                .map(|dep| 1 + walk(graph, dep, memo))
                .max()
                .unwrap_or(0);
            memo.insert(id.to_string(), longest);
            longest
        }
        let mut memo = HashMap::new();
        walk(self, task_id, &mut memo)
    }
}
