// SPDX-License-Identifier: MIT

//! Durable escalation log: a worker's unresolvable failure (ambiguous spec,
//! missing dependency) is appended here, separately from `FeatureState`, so
//! recovery tooling can surface outstanding escalations without scanning
//! every task record. Atomicity follows the same tmp-then-rename convention
//! as [`crate::state::store::StateStore`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::StateError;
use crate::state::model::{Escalation, EscalationCause};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub worker_id: String,
    pub task_id: String,
    pub cause: EscalationCause,
    pub message: String,
    pub context: Option<String>,
    pub resolved: bool,
}

impl EscalationRecord {
    pub fn to_task_escalation(&self) -> Escalation {
        Escalation {
            cause: self.cause,
            message: self.message.clone(),
            resolved: self.resolved,
        }
    }
}

pub struct EscalationStore {
    state_dir: PathBuf,
    feature: String,
}

impl EscalationStore {
    pub fn new(state_dir: impl Into<PathBuf>, feature: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            feature: feature.into(),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.escalations.json", self.feature))
    }

    fn tmp_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.escalations.json.tmp", self.feature))
    }

    pub fn load(&self) -> Result<Vec<EscalationRecord>, StateError> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, records: &[EscalationRecord]) -> Result<(), StateError> {
        fs::create_dir_all(&self.state_dir).map_err(|source| StateError::Io {
            path: self.state_dir.clone(),
            source,
        })?;
        let tmp = self.tmp_path();
        fs::write(&tmp, serde_json::to_vec_pretty(records)?).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, self.file_path()).map_err(|source| StateError::Io {
            path: self.file_path(),
            source,
        })?;
        Ok(())
    }

    pub fn append(&self, record: EscalationRecord) -> Result<(), StateError> {
        let mut records = self.load()?;
        records.push(record);
        self.save(&records)
    }

    /// Mark every unresolved escalation for `task_id` resolved, so an
    /// operator's `retry` command can clear the blocker before re-queuing.
    pub fn resolve_for_task(&self, task_id: &str) -> Result<(), StateError> {
        let mut records = self.load()?;
        for record in records.iter_mut().filter(|r| r.task_id == task_id) {
            record.resolved = true;
        }
        self.save(&records)
    }

    pub fn unresolved(&self) -> Result<Vec<EscalationRecord>, StateError> {
        Ok(self.load()?.into_iter().filter(|r| !r.resolved).collect())
    }

    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".mahabharatha").join("state")
    }
}
