// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::errors::GraphError;
use crate::graph::model::{Task, TaskGraphDocument, Level, TASK_GRAPH_SCHEMA_VERSION};
use crate::observability::messages::graph::{CycleDetected, FileOwnershipConflict};
use crate::observability::messages::StructuredLog;

pub fn validate_unique_ids(tasks: &[Task]) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.clone()) {
            return Err(GraphError::DuplicateTaskId {
                task_id: task.id.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate_dependency_references(tasks: &[Task]) -> Result<(), GraphError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(GraphError::UnresolvedDependency {
                    task_id: task.id.clone(),
                    missing_dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Depth-first cycle detection with path extraction, ported from the
/// "white / gray / black" DFS approach: `visited` marks nodes fully
/// explored (black), `rec_stack` marks nodes on the current path (gray),
/// and `path` lets us slice out exactly the cycle once we hit a gray node.
pub fn validate_acyclic(feature: &str, tasks: &[Task]) -> Result<(), GraphError> {
    let graph: HashMap<&str, &Vec<String>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), &t.dependencies))
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for task in tasks {
        if !visited.contains(task.id.as_str()) {
            let mut path = Vec::new();
            if let Some(cycle) = dfs_cycle_detection(&task.id, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                CycleDetected {
                    feature,
                    cycle: &cycle,
                }
                .log();
                return Err(GraphError::CyclicDependency { cycle });
            }
        }
    }
    Ok(())
}

fn dfs_cycle_detection(
    node: &str,
    graph: &HashMap<&str, &Vec<String>>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps.iter() {
            if rec_stack.contains(dep) {
                let cycle_start = path.iter().position(|x| x == dep).unwrap();
                let mut cycle = path[cycle_start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle_detection(dep, graph, visited, rec_stack, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Tasks scheduled within the same level must not both create or modify the
/// same file: a worker's worktree has no visibility into a sibling's
/// concurrent edits, so two owners of the same path would silently race at
/// merge time. `read` is shared and never checked.
pub fn validate_file_ownership(levels: &[Vec<&Task>]) -> Result<(), GraphError> {
    for level in levels {
        let mut owners: HashMap<&PathBuf, &str> = HashMap::new();
        for task in level {
            for path in task.files.create.iter().chain(task.files.modify.iter()) {
                if let Some(owner) = owners.get(path) {
                    if *owner != task.id.as_str() {
                        FileOwnershipConflict {
                            task_a: owner,
                            task_b: &task.id,
                            path: &path.display().to_string(),
                        }
                        .log();
                        return Err(GraphError::FileOwnershipConflict {
                            task_a: owner.to_string(),
                            task_b: task.id.clone(),
                            path: path.clone(),
                        });
                    }
                } else {
                    owners.insert(path, &task.id);
                }
            }
        }
    }
    Ok(())
}

/// A file created by one task must never be created by another task at any
/// level (spec §3 TaskGraph invariant v): unlike modifies, two "creates" of
/// the same path can never be sequenced, since the first writer's commit
/// would be clobbered rather than built upon.
pub fn validate_cross_level_create_uniqueness(levels: &[Vec<&Task>]) -> Result<(), GraphError> {
    let mut owners: HashMap<&PathBuf, &str> = HashMap::new();
    for level in levels {
        for task in level {
            for path in &task.files.create {
                if let Some(owner) = owners.get(path) {
                    if *owner != task.id.as_str() {
                        FileOwnershipConflict {
                            task_a: owner,
                            task_b: &task.id,
                            path: &path.display().to_string(),
                        }
                        .log();
                        return Err(GraphError::FileOwnershipConflict {
                            task_a: owner.to_string(),
                            task_b: task.id.clone(),
                            path: path.clone(),
                        });
                    }
                } else {
                    owners.insert(path, &task.id);
                }
            }
        }
    }
    Ok(())
}

/// Schema violations are hard-fail at load (spec §6): the declared schema
/// version and task count must match what's actually in the document.
pub fn validate_document_shape(document: &TaskGraphDocument) -> Result<(), GraphError> {
    if document.version != TASK_GRAPH_SCHEMA_VERSION {
        return Err(GraphError::UnsupportedVersion {
            found: document.version.clone(),
        });
    }
    if document.total_tasks != document.tasks.len() {
        return Err(GraphError::TaskCountMismatch {
            declared: document.total_tasks,
            actual: document.tasks.len(),
        });
    }
    Ok(())
}

/// A task's optional `level` field is redundant with derivation; if present
/// it must agree with the computed level exactly (spec §4.1, §9).
pub fn validate_task_level_consistency(tasks: &[Task], levels: &[Level]) -> Result<(), GraphError> {
    let computed: HashMap<&str, usize> = levels
        .iter()
        .flat_map(|level| level.task_ids.iter().map(move |id| (id.as_str(), level.index)))
        .collect();

    for task in tasks {
        if let Some(declared) = task.level {
            if let Some(&actual) = computed.get(task.id.as_str()) {
                if declared != actual {
                    return Err(GraphError::LevelMismatch {
                        task_id: task.id.clone(),
                        declared,
                        computed: actual,
                    });
                }
            }
        }
    }
    Ok(())
}

/// An author-supplied top-level `levels{}` map (spec §6) is validated
/// against the derived levels rather than trusted; any disagreement in
/// membership is a hard-fail at load.
pub fn validate_levels_map_consistency(
    feature: &str,
    declared: &HashMap<String, Vec<String>>,
    levels: &[Level],
) -> Result<(), GraphError> {
    if declared.is_empty() {
        return Ok(());
    }

    let computed: HashMap<String, HashSet<String>> = levels
        .iter()
        .map(|level| (level.index.to_string(), level.task_ids.iter().cloned().collect()))
        .collect();

    if declared.len() != computed.len() {
        return Err(GraphError::LevelsMapMismatch {
            feature: feature.to_string(),
        });
    }

    for (key, declared_ids) in declared {
        let declared_set: HashSet<String> = declared_ids.iter().cloned().collect();
        match computed.get(key) {
            Some(computed_set) if computed_set == &declared_set => {}
            _ => {
                return Err(GraphError::LevelsMapMismatch {
                    feature: feature.to_string(),
                })
            }
        }
    }
    Ok(())
}
