// SPDX-License-Identifier: MIT

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::errors::StateError;
use crate::observability::messages::state::{StateLoadFailed, StateSaved};
use crate::observability::messages::StructuredLog;
use crate::state::model::{FeatureState, TaskStatus, WorkerStatus};

/// Atomic, crash-safe persistence for a single feature's [`FeatureState`].
///
/// Writes go through a `.tmp` file followed by a `rename(2)`, which is
/// atomic on the same filesystem, and every successful save rotates the
/// previous good document into `.bak` before the new one lands so a
/// half-written `state.json` can always be recovered from. Read-modify-write
/// sequences hold an advisory `flock` for the duration of the critical
/// section, released when the lock file descriptor is dropped.
pub struct StateStore {
    state_dir: PathBuf,
    feature: String,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>, feature: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            feature: feature.into(),
        }
    }

    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".mahabharatha").join("state")
    }

    fn state_file(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.feature))
    }

    fn backup_file(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json.bak", self.feature))
    }

    fn tmp_file(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json.tmp", self.feature))
    }

    fn lock_file_path(&self) -> PathBuf {
        self.state_dir.join(format!(".{}.lock", self.feature))
    }

    /// Load the current state document, falling back to `.bak` if the
    /// primary copy fails to parse, and returning [`StateError::Corrupt`]
    /// only when neither copy is usable.
    pub fn load(&self) -> Result<FeatureState, StateError> {
        match self.try_load(&self.state_file()) {
            Ok(state) => Ok(state),
            Err(primary_err) => match self.try_load(&self.backup_file()) {
                Ok(state) => {
                    StateLoadFailed {
                        feature: &self.feature,
                        reason: &primary_err.to_string(),
                    }
                    .log();
                    Ok(state)
                }
                Err(_) => Err(StateError::Corrupt(format!(
                    "{}: {primary_err}",
                    self.feature
                ))),
            },
        }
    }

    /// Load state, or initialize a fresh [`FeatureState`] if no document
    /// exists yet for this feature.
    pub fn load_or_init(&self) -> Result<FeatureState, StateError> {
        if !self.state_file().exists() {
            return Ok(FeatureState::new(&self.feature));
        }
        self.load()
    }

    fn try_load(&self, path: &Path) -> Result<FeatureState, StateError> {
        let bytes = fs::read(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let state: FeatureState = serde_json::from_slice(&bytes)?;
        Ok(state)
    }

    /// Atomically persist `state`, rotating the previous copy to `.bak`.
    pub fn save(&self, state: &FeatureState) -> Result<(), StateError> {
        fs::create_dir_all(&self.state_dir).map_err(|source| StateError::Io {
            path: self.state_dir.clone(),
            source,
        })?;

        let tmp_path = self.tmp_file();
        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp_path, &json).map_err(|source| StateError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        let file = File::open(&tmp_path).map_err(|source| StateError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| StateError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        let state_path = self.state_file();
        if state_path.exists() {
            fs::rename(&state_path, self.backup_file()).map_err(|source| StateError::Io {
                path: state_path.clone(),
                source,
            })?;
        }
        fs::rename(&tmp_path, &state_path).map_err(|source| StateError::Io {
            path: state_path.clone(),
            source,
        })?;

        StateSaved {
            feature: &self.feature,
            sequence: state.sequence,
        }
        .log();
        Ok(())
    }

    /// Read, mutate, and atomically save the state document while holding
    /// an exclusive advisory lock, so concurrent orchestrator/worker
    /// processes never interleave a read-modify-write cycle.
    pub fn modify<F>(&self, f: F) -> Result<FeatureState, StateError>
    where
        F: FnOnce(&mut FeatureState),
    {
        fs::create_dir_all(&self.state_dir).map_err(|source| StateError::Io {
            path: self.state_dir.clone(),
            source,
        })?;

        let lock_path = self.lock_file_path();
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .map_err(|source| StateError::Lock {
                path: lock_path.clone(),
                source,
            })?;

        let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(StateError::Lock {
                path: lock_path,
                source: std::io::Error::last_os_error(),
            });
        }

        let mut state = self.load_or_init()?;
        let before = state.sequence;
        let snapshot = serde_json::to_vec(&state)?;
        f(&mut state);
        if state.sequence < before {
            return Err(StateError::SequenceRegression {
                on_disk: before,
                attempted: state.sequence,
            });
        }
        if serde_json::to_vec(&state)? != snapshot {
            self.save(&state)?;
        }
        // lock released here when `lock` drops and the fd closes.
        Ok(state)
    }

    /// Worker-facing counterpart to [`modify`](Self::modify): a worker
    /// process owns only its own `workers[worker_id]` record and the
    /// in-progress transition of the task it's running, never `attempts`,
    /// `escalation`, or level bookkeeping. Scoping is enforced here, by the
    /// fields `WorkerProgressUpdate` exposes, rather than by filesystem
    /// permissions on `state.json`.
    pub fn update_worker(
        &self,
        worker_id: &str,
        update: WorkerProgressUpdate,
    ) -> Result<FeatureState, StateError> {
        self.modify(|state| {
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return;
            };

            let mut changed = false;
            if let Some(status) = update.status {
                if worker.status != status {
                    worker.status = status;
                    changed = true;
                }
            }
            if let Some(heartbeat) = update.last_heartbeat {
                if worker.last_heartbeat != Some(heartbeat) {
                    worker.last_heartbeat = Some(heartbeat);
                    changed = true;
                }
            }
            if !changed {
                return;
            }

            let task_id = worker.task_id.clone();
            if let Some(task) = state.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Dispatched {
                    task.status = TaskStatus::InProgress;
                }
            }
            state.record_event(format!("worker {worker_id} reported progress"));
        })
    }
}

/// Fields a worker is permitted to patch on its own [`WorkerRecord`] via
/// [`StateStore::update_worker`].
#[derive(Debug, Default, Clone)]
pub struct WorkerProgressUpdate {
    pub status: Option<WorkerStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}
