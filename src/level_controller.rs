// SPDX-License-Identifier: MIT

//! Top-level per-level state machine (spec §4.8): `pending -> running ->
//! merging -> (complete | failed)`. Ties together the Scheduler, the
//! Launcher, the HeartbeatMonitor, the WorktreeManager, and the
//! MergeCoordinator the way the teacher's `level_by_level.rs` executor
//! ties together `DependencyGraph`, `ProcessorMap`, and `DagExecutor` —
//! generalized from "run processors to completion" to "run workers,
//! verify, and merge".

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::config::{OrchestratorConfig, PortRange};
use crate::errors::{OrchestratorError, RetryError};
use crate::graph::TaskGraph;
use crate::heartbeat::HeartbeatMonitor;
use crate::launcher::{Launcher, WorkerOutcome};
use crate::merge::gate::{run_gate, GateSpec, GateVerdict};
use crate::merge::MergeCoordinator;
use crate::retry::{is_retryable, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::state::escalation::EscalationRecord;
use crate::state::{
    EscalationCause, EscalationStore, FeatureState, LevelRecord, LevelStatus, StateStore,
    TaskRecord, TaskStatus, WorkerRecord, WorkerStatus,
};
use crate::worktree::{base_branch, WorktreeManager};

/// Terminal outcome of driving one level to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelOutcome {
    Complete,
    Failed,
}

struct ActiveWorker {
    worker_id: String,
    handle: String,
    branch: String,
    worktree_path: PathBuf,
    port: u16,
    attempt: u32,
}

/// On-disk document promised to every worker at spawn time (spec §6): "a
/// worker-assignments document listing its assigned tasks per level".
/// `Task` already derives `Serialize`, so this just wraps it with the
/// addressing the worker needs to know which of its own records in
/// `FeatureState`/the heartbeat directory are its own.
#[derive(serde::Serialize)]
struct WorkerAssignment<'a> {
    feature: &'a str,
    worker_id: &'a str,
    level: usize,
    tasks: Vec<&'a crate::graph::model::Task>,
}

pub struct LevelController<'a> {
    graph: &'a TaskGraph,
    feature: String,
    graph_path: PathBuf,
    state_dir: PathBuf,
    state: StateStore,
    escalations: EscalationStore,
    scheduler: Scheduler,
    launcher: Box<dyn Launcher>,
    heartbeat: HeartbeatMonitor,
    worktrees: WorktreeManager,
    retry_policy: RetryPolicy,
    gates: Vec<GateSpec>,
    config_version: String,
    port_range: PortRange,
    poll_interval: Duration,
    terminate_grace: Duration,
    next_worker_seq: u32,
    active: HashMap<String, ActiveWorker>,
}

impl<'a> LevelController<'a> {
    pub fn new(
        graph: &'a TaskGraph,
        feature: impl Into<String>,
        repo_root: PathBuf,
        graph_path: PathBuf,
        launcher: Box<dyn Launcher>,
        config: &OrchestratorConfig,
    ) -> Self {
        let feature = feature.into();
        let state_dir = StateStore::default_dir(&repo_root);
        Self {
            graph,
            state: StateStore::new(state_dir.clone(), feature.clone()),
            escalations: EscalationStore::new(state_dir.clone(), feature.clone()),
            scheduler: Scheduler::new(config.concurrency.max_workers()),
            launcher,
            heartbeat: HeartbeatMonitor::new(config.heartbeat.stall_timeout_secs(), state_dir.clone()),
            terminate_grace: config.heartbeat.terminate_grace(),
            worktrees: WorktreeManager::new(repo_root),
            retry_policy: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                base_delay_ms: config.retry.base_delay_ms,
                max_delay_ms: config.retry.max_delay_ms,
            },
            gates: config.gates.clone(),
            config_version: config.version.clone(),
            port_range: config.ports.resolve(),
            poll_interval: Duration::from_secs(1),
            feature,
            graph_path,
            state_dir,
            next_worker_seq: 0,
            active: HashMap::new(),
        }
    }

    /// Write the worker-assignments document (spec §6) for `task` and build
    /// the env map the launch contract promises: `STATE_DIR`, `GRAPH_PATH`,
    /// `ASSIGNMENTS_PATH`, plus the worker's allocated `PORT`.
    fn prepare_launch_env(
        &self,
        worker_id: &str,
        level_index: usize,
        task: &crate::graph::model::Task,
        port: u16,
    ) -> Result<HashMap<String, String>, OrchestratorError> {
        let assignment = WorkerAssignment {
            feature: &self.feature,
            worker_id,
            level: level_index,
            tasks: vec![task],
        };
        let assignment_path = self.state_dir.join(format!("assignments-{worker_id}.json"));
        let bytes = serde_json::to_vec_pretty(&assignment)
            .map_err(|e| OrchestratorError::Config(format!("serializing worker assignment: {e}")))?;
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| OrchestratorError::Config(format!("creating {}: {e}", self.state_dir.display())))?;
        std::fs::write(&assignment_path, bytes)
            .map_err(|e| OrchestratorError::Config(format!("writing {}: {e}", assignment_path.display())))?;

        let mut env = HashMap::new();
        env.insert("STATE_DIR".to_string(), self.state_dir.display().to_string());
        env.insert("GRAPH_PATH".to_string(), self.graph_path.display().to_string());
        env.insert("ASSIGNMENTS_PATH".to_string(), assignment_path.display().to_string());
        env.insert("PORT".to_string(), port.to_string());
        Ok(env)
    }

    /// Drive every level of the graph to completion, or stop at the first
    /// level that fails. Idempotent on restart: a level already tagged
    /// `complete` in persisted state is skipped.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        self.worktrees
            .ensure_base_branches(&self.feature)
            .map_err(OrchestratorError::Worktree)?;

        let initial = self.state.load_or_init()?;
        let mut starting_level = initial.current_level;

        if initial.levels.is_empty() {
            self.initialize_level_records()?;
        }

        while starting_level < self.graph.levels.len() {
            match self.run_level(starting_level).await? {
                LevelOutcome::Complete => {
                    starting_level += 1;
                }
                LevelOutcome::Failed => {
                    return Err(OrchestratorError::LevelFailed { level: starting_level });
                }
            }
        }
        Ok(())
    }

    fn initialize_level_records(&self) -> Result<(), OrchestratorError> {
        self.state.modify(|state| {
            for level in &self.graph.levels {
                state.levels.push(LevelRecord {
                    index: level.index,
                    status: LevelStatus::Pending,
                    task_ids: level.task_ids.clone(),
                });
            }
            for level in &self.graph.levels {
                for task_id in &level.task_ids {
                    state.tasks.insert(
                        task_id.clone(),
                        TaskRecord {
                            id: task_id.clone(),
                            status: TaskStatus::Pending,
                            level: level.index,
                            attempts: 0,
                            worker_id: None,
                            escalation: None,
                            skipped_by_operator: false,
                        },
                    );
                }
            }
            state.record_event("task graph loaded");
        })?;
        Ok(())
    }

    /// Run one level to `complete` or `failed` (spec §4.8's state machine).
    /// Empty levels skip dispatch and merge entirely and transition
    /// directly `pending -> complete` (spec §8's zero-task-level boundary
    /// case) while still advancing the level-tag chain.
    pub async fn run_level(&mut self, level_index: usize) -> Result<LevelOutcome, OrchestratorError> {
        let level = &self.graph.levels[level_index];

        if level.task_ids.is_empty() {
            self.state.modify(|state| {
                state.levels[level_index].status = LevelStatus::Complete;
                state.current_level = level_index + 1;
                state.record_event(format!("level {level_index} complete (no tasks)"));
            })?;
            return Ok(LevelOutcome::Complete);
        }

        self.state.modify(|state| {
            state.levels[level_index].status = LevelStatus::Dispatching;
            state.record_event(format!("level {level_index} running"));
        })?;

        loop {
            let state = self.state.load()?;
            let completed = completed_set(&state);

            if self.active.is_empty() && self.dispatchable_remaining(&state, level_index).is_empty() {
                break;
            }

            self.dispatch_ready(level_index, &completed).await?;
            self.poll_active(level_index).await?;

            if self.active.is_empty() {
                let state = self.state.load()?;
                if self.dispatchable_remaining(&state, level_index).is_empty() {
                    break;
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        let state = self.state.load()?;
        let level_task_ids = &self.graph.levels[level_index].task_ids;
        let any_blocked = level_task_ids.iter().any(|id| {
            state
                .tasks
                .get(id)
                .map(|t| t.status == TaskStatus::Blocked)
                .unwrap_or(false)
        });

        if any_blocked {
            self.state.modify(|state| {
                state.levels[level_index].status = LevelStatus::RolledBack;
                state.record_event(format!("level {level_index} failed: blocked task present"));
            })?;
            return Ok(LevelOutcome::Failed);
        }

        self.merge_level(level_index).await
    }

    fn dispatchable_remaining(&self, state: &FeatureState, level_index: usize) -> Vec<String> {
        let completed = completed_set(state);
        self.graph
            .ready_set(level_index, &completed)
            .into_iter()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .map(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Blocked))
                    .unwrap_or(true)
                    && !self.active.contains_key(id)
            })
            .collect()
    }

    async fn dispatch_ready(
        &mut self,
        level_index: usize,
        completed: &HashSet<String>,
    ) -> Result<(), OrchestratorError> {
        let plan = self
            .scheduler
            .plan_dispatch(self.graph, level_index, completed, self.active.len());

        let snapshot = self.state.load()?;

        for item in plan {
            let task = self
                .graph
                .task(&item.task_id)
                .expect("dispatch plan only contains tasks present in the graph");

            self.next_worker_seq += 1;
            let worker_id = self.next_worker_seq.to_string();

            let (worktree_path, branch) = self
                .worktrees
                .create_worker_worktree(&self.feature, &worker_id)
                .map_err(OrchestratorError::Worktree)?;

            let in_use: HashSet<u16> = self.active.values().map(|w| w.port).collect();
            let port = self.port_range.allocate(&in_use).unwrap_or(self.port_range.start());

            let attempt = snapshot.tasks.get(&task.id).map(|t| t.attempts).unwrap_or(0);

            let env = self.prepare_launch_env(&worker_id, level_index, task, port)?;
            let handle = self
                .launcher
                .spawn(&worker_id, &self.feature, &worktree_path, &branch, &env)
                .await
                .map_err(OrchestratorError::Launch)?;

            self.scheduler.log_dispatch(&task.id, &worker_id, level_index);

            self.state.modify(|state| {
                let record = state.tasks.get_mut(&task.id).expect("task exists");
                record.status = TaskStatus::Dispatched;
                record.worker_id = Some(worker_id.clone());
                state.workers.insert(
                    worker_id.clone(),
                    WorkerRecord {
                        worker_id: worker_id.clone(),
                        task_id: task.id.clone(),
                        status: WorkerStatus::Starting,
                        pid_or_container_id: Some(handle.clone()),
                        branch: branch.clone(),
                        worktree_path: worktree_path.display().to_string(),
                        last_heartbeat: Some(Utc::now()),
                        started_at: Utc::now(),
                    },
                );
                state.record_event(format!("task {} dispatched to worker {worker_id}", task.id));
            })?;

            self.active.insert(
                task.id.clone(),
                ActiveWorker {
                    worker_id,
                    handle,
                    branch,
                    worktree_path,
                    port,
                    attempt,
                },
            );
        }
        Ok(())
    }

    async fn poll_active(&mut self, level_index: usize) -> Result<(), OrchestratorError> {
        let mut finished: Vec<(String, WorkerOutcome)> = Vec::new();
        let now = Utc::now();

        for (task_id, active) in self.active.iter() {
            let state = self.state.load()?;
            let recorded_heartbeat = state
                .workers
                .get(&active.worker_id)
                .and_then(|w| w.last_heartbeat);

            // Reconcile against the worker's own heartbeat file (spec
            // §4.5/§6): it is written directly by the worker and may be
            // fresher than whatever `update_worker` last persisted into
            // `FeatureState`.
            let file_heartbeat = self.heartbeat.read_heartbeat(&active.worker_id).map(|r| r.ts);
            let last_heartbeat = match (recorded_heartbeat, file_heartbeat) {
                (Some(r), Some(f)) => Some(r.max(f)),
                (Some(r), None) => Some(r),
                (None, Some(f)) => Some(f),
                (None, None) => None,
            };
            if let Some(fresh) = file_heartbeat {
                if recorded_heartbeat.map_or(true, |r| fresh > r) {
                    self.state.update_worker(
                        &active.worker_id,
                        crate::state::WorkerProgressUpdate {
                            status: None,
                            last_heartbeat: Some(fresh),
                        },
                    )?;
                }
            }

            let launcher_outcome = self
                .launcher
                .poll(&active.worker_id, &active.handle)
                .await
                .map_err(OrchestratorError::Launch)?;

            if let Some(outcome) = launcher_outcome {
                finished.push((task_id.clone(), outcome));
                continue;
            }

            if self.heartbeat.is_stalled(&active.worker_id, last_heartbeat, now) {
                self.launcher
                    .terminate(&active.worker_id, &active.handle)
                    .await
                    .map_err(OrchestratorError::Launch)?;
                self.await_exit_or_kill(active).await?;
                finished.push((task_id.clone(), WorkerOutcome::Crashed { exit_code: None }));
            }
        }

        for (task_id, outcome) in finished {
            self.finish_task(level_index, &task_id, outcome).await?;
        }
        Ok(())
    }

    /// Spec §4.4/§5's two-phase stop: `terminate` is a graceful signal, not
    /// a guarantee. Poll the launcher for exit until `terminate_grace`
    /// elapses, then escalate to a hard `kill`.
    async fn await_exit_or_kill(&self, active: &ActiveWorker) -> Result<(), OrchestratorError> {
        let deadline = tokio::time::Instant::now() + self.terminate_grace;
        let poll_interval = Duration::from_millis(50).min(self.terminate_grace);

        loop {
            if self
                .launcher
                .poll(&active.worker_id, &active.handle)
                .await
                .map_err(OrchestratorError::Launch)?
                .is_some()
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                self.launcher
                    .kill(&active.worker_id, &active.handle)
                    .await
                    .map_err(OrchestratorError::Launch)?;
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn finish_task(
        &mut self,
        level_index: usize,
        task_id: &str,
        outcome: WorkerOutcome,
    ) -> Result<(), OrchestratorError> {
        let active = self.active.remove(task_id).expect("active worker present");

        match outcome {
            WorkerOutcome::Succeeded => {
                self.verify_and_complete(level_index, task_id, active).await?;
            }
            WorkerOutcome::Checkpointed => {
                self.state.modify(|state| {
                    state.tasks.get_mut(task_id).expect("task exists").status =
                        TaskStatus::Checkpointed;
                    if let Some(worker) = state.workers.get_mut(&active.worker_id) {
                        worker.status = WorkerStatus::Checkpointed;
                    }
                    state.record_event(format!("task {task_id} checkpointed"));
                })?;
                self.respawn_from_checkpoint(level_index, task_id, &active).await?;
            }
            WorkerOutcome::Crashed { .. } => {
                self.handle_failure(
                    task_id,
                    &active,
                    EscalationCause::StallOrCrash,
                    "stall/crash",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Run the task's own acceptance check (spec §3/§4.7 `verification`)
    /// once the worker exits 0, before counting the task `completed`. A
    /// task with no `verification` block is trusted on the worker's exit
    /// code alone.
    async fn verify_and_complete(
        &mut self,
        _level_index: usize,
        task_id: &str,
        active: ActiveWorker,
    ) -> Result<(), OrchestratorError> {
        let task = self.graph.task(task_id).expect("task exists");

        let Some(verification) = task.verification.clone() else {
            self.state.modify(|state| {
                state.tasks.get_mut(task_id).expect("task exists").status = TaskStatus::Completed;
                if let Some(worker) = state.workers.get_mut(&active.worker_id) {
                    worker.status = WorkerStatus::Succeeded;
                }
                state.record_event(format!("task {task_id} completed"));
            })?;
            return Ok(());
        };

        self.state.modify(|state| {
            state.tasks.get_mut(task_id).expect("task exists").status = TaskStatus::Verifying;
            state.record_event(format!("task {task_id} verifying"));
        })?;

        let gate_spec = GateSpec {
            name: format!("verify-{task_id}"),
            command: verification.command,
            args: verification.args,
            required: true,
            timeout_seconds: verification.timeout_seconds,
        };
        let outcome = run_gate(&gate_spec, &active.worktree_path)
            .await
            .map_err(OrchestratorError::Gate)?;

        match outcome.verdict {
            GateVerdict::Pass => {
                self.state.modify(|state| {
                    state.tasks.get_mut(task_id).expect("task exists").status =
                        TaskStatus::Completed;
                    if let Some(worker) = state.workers.get_mut(&active.worker_id) {
                        worker.status = WorkerStatus::Succeeded;
                    }
                    state.record_event(format!("task {task_id} completed"));
                })?;
                Ok(())
            }
            GateVerdict::Timeout => {
                self.handle_failure(
                    task_id,
                    &active,
                    EscalationCause::VerificationTimeout,
                    "verification timed out",
                )
                .await
            }
            GateVerdict::Fail => {
                self.handle_failure(
                    task_id,
                    &active,
                    EscalationCause::VerificationFailed,
                    "verification failed",
                )
                .await
            }
        }
    }

    /// A checkpointed task (exit code 2) resumes on a fresh worker bound to
    /// the same branch and worktree, per spec §4.7/S5 — no retry-attempt
    /// increment, since this is a cooperative pause, not a failure.
    async fn respawn_from_checkpoint(
        &mut self,
        level_index: usize,
        task_id: &str,
        previous: &ActiveWorker,
    ) -> Result<(), OrchestratorError> {
        let task = self.graph.task(task_id).expect("task exists");
        let env = self.prepare_launch_env(&previous.worker_id, level_index, task, previous.port)?;
        let handle = self
            .launcher
            .spawn(&previous.worker_id, &self.feature, &previous.worktree_path, &previous.branch, &env)
            .await
            .map_err(OrchestratorError::Launch)?;

        self.state.modify(|state| {
            state.tasks.get_mut(task_id).expect("task exists").status = TaskStatus::InProgress;
            if let Some(worker) = state.workers.get_mut(&previous.worker_id) {
                worker.status = WorkerStatus::Running;
                worker.pid_or_container_id = Some(handle.clone());
                worker.last_heartbeat = Some(Utc::now());
            }
            state.record_event(format!("task {task_id} resumed from checkpoint"));
        })?;

        self.active.insert(
            task_id.to_string(),
            ActiveWorker {
                worker_id: previous.worker_id.clone(),
                handle,
                branch: previous.branch.clone(),
                worktree_path: previous.worktree_path.clone(),
                port: previous.port,
                attempt: previous.attempt,
            },
        );
        Ok(())
    }

    async fn handle_failure(
        &mut self,
        task_id: &str,
        active: &ActiveWorker,
        cause: EscalationCause,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let attempt = active.attempt + 1;
        let retryable = is_retryable(cause) && self.retry_policy.should_retry(attempt);

        if retryable {
            self.state.modify(|state| {
                let record = state.tasks.get_mut(task_id).expect("task exists");
                record.status = TaskStatus::Pending;
                record.attempts = attempt;
                record.worker_id = None;
                if let Some(worker) = state.workers.get_mut(&active.worker_id) {
                    worker.status = WorkerStatus::Crashed;
                }
                state.record_event(format!("task {task_id} failed ({reason}), retry {attempt} queued"));
            })?;
            let backoff = self.retry_policy.backoff_for_attempt(attempt);
            tokio::time::sleep(backoff).await;
        } else {
            self.state.modify(|state| {
                let record = state.tasks.get_mut(task_id).expect("task exists");
                record.status = TaskStatus::Blocked;
                record.attempts = attempt;
                if let Some(worker) = state.workers.get_mut(&active.worker_id) {
                    worker.status = WorkerStatus::Crashed;
                }
                state.record_event(format!("task {task_id} blocked after {attempt} attempts ({reason})"));
            })?;

            let budget_exhausted = RetryError::BudgetExhausted {
                task_id: task_id.to_string(),
                attempts: attempt,
            };
            self.escalations.append(EscalationRecord {
                worker_id: active.worker_id.clone(),
                task_id: task_id.to_string(),
                cause,
                message: budget_exhausted.to_string(),
                context: None,
                resolved: false,
            })?;
        }
        Ok(())
    }

    async fn merge_level(&self, level_index: usize) -> Result<LevelOutcome, OrchestratorError> {
        self.state.modify(|state| {
            state.levels[level_index].status = LevelStatus::Merging;
            state.record_event(format!("level {level_index} merging"));
        })?;

        let state = self.state.load()?;
        let worker_ids: Vec<String> = self.graph.levels[level_index]
            .task_ids
            .iter()
            .filter_map(|task_id| state.tasks.get(task_id))
            .filter_map(|t| t.worker_id.clone())
            .collect();

        let coordinator = MergeCoordinator::new(&self.worktrees, self.config_version.clone());
        let outcome = coordinator
            .merge_level(&self.feature, level_index, &worker_ids, &self.gates, &state.gate_cache)
            .await
            .map_err(OrchestratorError::Merge)?;

        if let Some(conflict) = &outcome.conflict {
            let conflicting_worker_id = conflict
                .branch
                .rsplit("worker-")
                .next()
                .unwrap_or_default()
                .to_string();
            let task_id = state
                .tasks
                .values()
                .find(|t| t.worker_id.as_deref() == Some(conflicting_worker_id.as_str()))
                .map(|t| t.id.clone())
                .unwrap_or_else(|| format!("level-{level_index}"));

            self.escalations.append(EscalationRecord {
                worker_id: conflicting_worker_id,
                task_id,
                cause: EscalationCause::MergeConflict,
                message: format!(
                    "merge conflict integrating {} into {}",
                    conflict.branch, conflict.target
                ),
                context: None,
                resolved: false,
            })?;
        }

        self.state.modify(|state| {
            for result in &outcome.gate_results {
                state.gate_cache.insert(result.gate_name.clone(), result.clone());
            }
            if outcome.succeeded {
                state.levels[level_index].status = LevelStatus::Complete;
                state.current_level = level_index + 1;
                state.record_event(format!("level {level_index} complete"));
            } else {
                let reason = if outcome.conflict.is_some() {
                    "a merge conflict"
                } else {
                    "a required gate failed"
                };
                state.levels[level_index].status = LevelStatus::RolledBack;
                state.record_event(format!("level {level_index} rolled back: {reason}"));
            }
        })?;

        Ok(if outcome.succeeded {
            LevelOutcome::Complete
        } else {
            LevelOutcome::Failed
        })
    }

    /// The base branch name this controller's feature rolls onto, exposed
    /// for the CLI's `status` command.
    pub fn base_branch(&self) -> String {
        base_branch(&self.feature)
    }
}

fn completed_set(state: &FeatureState) -> HashSet<String> {
    state
        .tasks
        .iter()
        .filter(|(_, t)| matches!(t.status, TaskStatus::Completed))
        .map(|(id, _)| id.clone())
        .collect()
}
