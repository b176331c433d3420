// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Dispatched,
    InProgress,
    Verifying,
    Checkpointed,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub level: usize,
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub escalation: Option<Escalation>,
    #[serde(default)]
    pub skipped_by_operator: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Checkpointed,
    Succeeded,
    Crashed,
    Stalled,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub task_id: String,
    pub status: WorkerStatus,
    pub pid_or_container_id: Option<String>,
    pub branch: String,
    pub worktree_path: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Dispatching,
    AwaitingMerge,
    Merging,
    Complete,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelRecord {
    pub index: usize,
    pub status: LevelStatus,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCause {
    VerificationFailed,
    StallOrCrash,
    AmbiguousSpec,
    MissingDependency,
    VerificationTimeout,
    MergeConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub cause: EscalationCause,
    pub message: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
    Skip,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub outcome: GateOutcome,
    pub exit_code: Option<i32>,
    pub log_path: String,
    pub fingerprint: String,
    pub ran_at: DateTime<Utc>,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Pass
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub message: String,
}

const MAX_EVENTS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub feature: String,
    pub sequence: u64,
    pub current_level: usize,
    pub tasks: HashMap<String, TaskRecord>,
    pub workers: HashMap<String, WorkerRecord>,
    pub levels: Vec<LevelRecord>,
    pub gate_cache: HashMap<String, GateResult>,
    #[serde(default)]
    pub events: Vec<StateEvent>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl FeatureState {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            feature: feature.into(),
            sequence: 0,
            current_level: 0,
            tasks: HashMap::new(),
            workers: HashMap::new(),
            levels: Vec::new(),
            gate_cache: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn record_event(&mut self, message: impl Into<String>) {
        self.sequence += 1;
        self.events.push(StateEvent {
            sequence: self.sequence,
            at: Utc::now(),
            message: message.into(),
        });
        if self.events.len() > MAX_EVENTS {
            let overflow = self.events.len() - MAX_EVENTS;
            self.events.drain(0..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_schema_version_and_zero_sequence() {
        let state = FeatureState::new("widget-export");
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.sequence, 0);
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn record_event_bumps_sequence_and_bounds_history() {
        let mut state = FeatureState::new("widget-export");
        for i in 0..(MAX_EVENTS + 10) {
            state.record_event(format!("event {i}"));
        }
        assert_eq!(state.sequence, (MAX_EVENTS + 10) as u64);
        assert_eq!(state.events.len(), MAX_EVENTS);
        assert_eq!(state.events.last().unwrap().message, "event 509");
    }
}
