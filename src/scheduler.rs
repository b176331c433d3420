// SPDX-License-Identifier: MIT

//! Assigns ready tasks within the current level to idle workers, honoring a
//! configured concurrency cap. Mirrors the teacher's level executor's
//! semaphore-bounded concurrent dispatch loop, generalized from "spawn a
//! processor future" to "spawn a worker and track its worktree/branch".

use std::collections::HashSet;

use crate::graph::TaskGraph;
use crate::observability::messages::scheduler::{LevelReady, TaskDispatched};
use crate::observability::messages::StructuredLog;

pub struct Scheduler {
    max_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub task_id: String,
}

impl Scheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Choose up to `max_concurrency - in_flight` tasks to dispatch from the
    /// ready set, breaking ties by longest critical path so that tasks
    /// blocking the most downstream work start first.
    pub fn plan_dispatch(
        &self,
        graph: &TaskGraph,
        level: usize,
        completed: &HashSet<String>,
        in_flight: usize,
    ) -> Vec<DispatchPlan> {
        let mut ready = graph.ready_set(level, completed);
        if ready.is_empty() {
            return Vec::new();
        }

        LevelReady {
            level,
            ready_task_ids: &ready,
        }
        .log();

        ready.sort_by(|a, b| {
            graph
                .critical_path_length(b)
                .cmp(&graph.critical_path_length(a))
                .then_with(|| a.cmp(b))
        });

        let slots = self.max_concurrency.saturating_sub(in_flight);
        ready
            .into_iter()
            .take(slots)
            .map(|task_id| DispatchPlan { task_id })
            .collect()
    }

    pub fn log_dispatch(&self, task_id: &str, worker_id: &str, level: usize) {
        TaskDispatched {
            task_id,
            worker_id,
            level,
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{Task, TaskFiles, TaskGraphDocument, TASK_GRAPH_SCHEMA_VERSION};
    use crate::graph::TaskGraph;
    use std::collections::HashMap;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            files: TaskFiles::default(),
            verification: None,
            level: None,
            consumers: Vec::new(),
            integration_test: None,
            context: None,
        }
    }

    fn doc(tasks: Vec<Task>) -> TaskGraphDocument {
        TaskGraphDocument {
            feature: "feat".into(),
            version: TASK_GRAPH_SCHEMA_VERSION.to_string(),
            total_tasks: tasks.len(),
            tasks,
            levels: HashMap::new(),
        }
    }

    #[test]
    fn respects_concurrency_cap() {
        let doc = doc(vec![task("a", &[]), task("b", &[]), task("c", &[])]);
        let graph = TaskGraph::from_document(doc).unwrap();
        let scheduler = Scheduler::new(2);
        let plan = scheduler.plan_dispatch(&graph, 0, &HashSet::new(), 0);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn prefers_longer_critical_path_first() {
        let doc = doc(vec![
            task("short", &[]),
            task("long", &[]),
            task("long-mid", &["long"]),
            task("long-leaf", &["long-mid"]),
        ]);
        let graph = TaskGraph::from_document(doc).unwrap();
        let scheduler = Scheduler::new(1);
        let plan = scheduler.plan_dispatch(&graph, 0, &HashSet::new(), 0);
        assert_eq!(plan[0].task_id, "long");
    }

    #[test]
    fn no_slots_when_already_at_capacity() {
        let doc = doc(vec![task("a", &[])]);
        let graph = TaskGraph::from_document(doc).unwrap();
        let scheduler = Scheduler::new(2);
        let plan = scheduler.plan_dispatch(&graph, 0, &HashSet::new(), 2);
        assert!(plan.is_empty());
    }
}
