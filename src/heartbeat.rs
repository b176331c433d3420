// SPDX-License-Identifier: MIT

//! Stall detection: a worker is considered stalled when no heartbeat has
//! been observed for longer than the configured timeout, distinct from a
//! launcher-reported crash (a dead process/container the backend already
//! knows has exited).
//!
//! Per spec §4.5/§6, a worker's own heartbeat is not the orchestrator's
//! opinion of it — it's a file the worker writes itself, every ~15s, at
//! `.mahabharatha/state/heartbeat-<id>.json`. This module reads that file;
//! [`crate::level_controller`] reconciles it against the state document's
//! `last_heartbeat` and persists whichever is fresher.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observability::messages::heartbeat::WorkerStalled;
use crate::observability::messages::StructuredLog;

pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 120;

/// The single-field document a worker writes every ~15 seconds (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub id: String,
    pub worker_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

pub struct HeartbeatMonitor {
    timeout_secs: u64,
    state_dir: PathBuf,
}

impl HeartbeatMonitor {
    pub fn new(timeout_secs: u64, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            timeout_secs,
            state_dir: state_dir.into(),
        }
    }

    pub fn default_timeout(state_dir: impl Into<PathBuf>) -> Self {
        Self::new(DEFAULT_STALL_TIMEOUT_SECS, state_dir)
    }

    fn heartbeat_path(&self, worker_id: &str) -> PathBuf {
        self.state_dir.join(format!("heartbeat-{worker_id}.json"))
    }

    /// Read and parse `worker_id`'s heartbeat file, if present and valid.
    /// A missing or malformed file is not an error here — it just means no
    /// fresher timestamp is available than whatever the state document
    /// already holds.
    pub fn read_heartbeat(&self, worker_id: &str) -> Option<HeartbeatRecord> {
        let bytes = std::fs::read(self.heartbeat_path(worker_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// `true` if `last_heartbeat` is missing (never reported) or older than
    /// the configured timeout as of `now`.
    pub fn is_stalled(&self, worker_id: &str, last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_heartbeat else {
            return true;
        };
        let elapsed = (now - last).num_seconds().max(0) as u64;
        let stalled = elapsed >= self.timeout_secs;
        if stalled {
            WorkerStalled {
                worker_id,
                seconds_since_heartbeat: elapsed,
            }
            .log();
        }
        stalled
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}
