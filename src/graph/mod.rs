// SPDX-License-Identifier: MIT

pub mod levels;
pub mod model;
pub mod validate;

use std::collections::HashMap;
use std::path::Path;

pub use model::{DependencyMap, Level, Task, TaskGraph, TaskGraphDocument, Verification};

use crate::errors::GraphError;
use crate::observability::messages::graph::GraphLoaded;
use crate::observability::messages::StructuredLog;

impl TaskGraph {
    /// Parse, validate, and derive levels for a task graph document on disk.
    pub fn load(path: &Path) -> Result<TaskGraph, GraphError> {
        let bytes = std::fs::read(path).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: TaskGraphDocument = serde_json::from_slice(&bytes)?;
        Self::from_document(document)
    }

    pub fn from_document(document: TaskGraphDocument) -> Result<TaskGraph, GraphError> {
        validate::validate_document_shape(&document)?;
        validate::validate_unique_ids(&document.tasks)?;
        validate::validate_dependency_references(&document.tasks)?;
        validate::validate_acyclic(&document.feature, &document.tasks)?;

        let all_ids: Vec<String> = document.tasks.iter().map(|t| t.id.clone()).collect();
        let dependencies: HashMap<String, Vec<String>> = document
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();

        let mut forward_map: HashMap<String, Vec<String>> =
            all_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        for task in &document.tasks {
            for dep in &task.dependencies {
                forward_map.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
        let forward = DependencyMap(forward_map);

        let levels = levels::compute_levels(&all_ids, &forward, &dependencies);

        validate::validate_task_level_consistency(&document.tasks, &levels)?;
        validate::validate_levels_map_consistency(&document.feature, &document.levels, &levels)?;

        let tasks_by_id: HashMap<String, Task> = document
            .tasks
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let level_task_refs: Vec<Vec<&Task>> = levels
            .iter()
            .map(|level| {
                level
                    .task_ids
                    .iter()
                    .map(|id| tasks_by_id.get(id).expect("level task present in map"))
                    .collect()
            })
            .collect();
        validate::validate_file_ownership(&level_task_refs)?;
        validate::validate_cross_level_create_uniqueness(&level_task_refs)?;

        GraphLoaded {
            feature: &document.feature,
            task_count: tasks_by_id.len(),
            level_count: levels.len(),
        }
        .log();

        Ok(TaskGraph {
            feature: document.feature,
            tasks: tasks_by_id,
            forward,
            levels,
        })
    }
}
