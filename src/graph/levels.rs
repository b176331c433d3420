// SPDX-License-Identifier: MIT

use std::collections::{HashMap, VecDeque};

use crate::graph::model::{DependencyMap, Level};

/// Derive topological levels via Kahn's algorithm over a reverse-dependency
/// in-degree count, the same optimization the teacher's level executor
/// uses to get O(V + E) level computation instead of O(n^2).
///
/// Every id in `all_ids` must appear; `forward` maps a task id to the ids
/// of tasks that depend on it (so decrementing in-degree on `forward`
/// lookups, not on `depends_on` lookups, is what admits a node to the next
/// level).
pub fn compute_levels(all_ids: &[String], forward: &DependencyMap, depends_on: &HashMap<String, Vec<String>>) -> Vec<Level> {
    let mut in_degree: HashMap<String, usize> = all_ids
        .iter()
        .map(|id| (id.clone(), depends_on.get(id).map(|d| d.len()).unwrap_or(0)))
        .collect();

    let mut queue: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut levels = Vec::new();
    let mut index = 0;

    while !queue.is_empty() {
        let mut current: Vec<String> = queue.drain(..).collect();
        current.sort();

        for id in &current {
            if let Some(dependents) = forward.0.get(id) {
                for dependent in dependents {
                    if let Some(count) = in_degree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        levels.push(Level {
            index,
            task_ids: current,
        });
        index += 1;
    }

    levels
}
