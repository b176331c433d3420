// SPDX-License-Identifier: MIT

//! End-to-end tests that drive [`LevelController`] against a real git
//! repository, [`StateStore`], and [`WorktreeManager`] exactly as `main`
//! wires them. The one thing standing in for the outside world is the
//! [`Launcher`] — per spec §9's worker-as-black-box note, any conforming
//! launcher is interchangeable, so these tests supply an in-process
//! [`FakeLauncher`] that resolves synchronously instead of shelling out to
//! a `mahabharatha-worker` binary that does not exist in this crate.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use git2::Repository;

use crate::config::{ConcurrencyConfig, HeartbeatConfig, OrchestratorConfig, PortRangeConfig};
use crate::errors::LaunchError;
use crate::graph::model::{Task, TaskFiles, TaskGraphDocument, Verification, TASK_GRAPH_SCHEMA_VERSION};
use crate::graph::TaskGraph;
use crate::launcher::{Launcher, WorkerOutcome};
use crate::level_controller::LevelController;
use crate::merge::gate::GateSpec;
use crate::retry::RetryPolicy;
use crate::state::{EscalationStore, LevelStatus, StateStore, TaskStatus};
use crate::worktree::{base_branch, level_complete_tag};

/// Reads the worker-assignments document the orchestrator promised at
/// `ASSIGNMENTS_PATH` (spec §6) and pulls out the scripted behavior a test
/// stashed in the task's opaque `context` field: a tiny DSL (plain success,
/// stall-then-retry, checkpoint-then-resume) so a test can drive specific
/// worker behaviors without a real LLM-backed process.
fn read_assignment(env: &HashMap<String, String>) -> (String, String) {
    let path = env
        .get("ASSIGNMENTS_PATH")
        .expect("launch env carries ASSIGNMENTS_PATH");
    let bytes = fs::read(path).expect("assignments document is written before spawn");
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).expect("assignments document is valid json");
    let task = &value["tasks"][0];
    let task_id = task["id"].as_str().unwrap_or_default().to_string();
    let dsl = task["context"].as_str().unwrap_or_default().to_string();
    (task_id, dsl)
}

struct FakeLauncher {
    attempts_by_task: Mutex<HashMap<String, u32>>,
    outcomes_by_worker: Mutex<HashMap<String, WorkerOutcome>>,
    stalled_workers: Mutex<HashSet<String>>,
}

impl FakeLauncher {
    fn new() -> Self {
        Self {
            attempts_by_task: Mutex::new(HashMap::new()),
            outcomes_by_worker: Mutex::new(HashMap::new()),
            stalled_workers: Mutex::new(HashSet::new()),
        }
    }

    fn bump_attempt(&self, task_id: &str) -> u32 {
        let mut attempts = self.attempts_by_task.lock().unwrap();
        let counter = attempts.entry(task_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn commit_file(&self, worktree_path: &Path, filename: &str, message: &str) {
        self.commit_change(worktree_path, filename, &format!("{filename}\n"), message);
    }

    fn commit_change(&self, worktree_path: &Path, filename: &str, content: &str, message: &str) {
        fs::write(worktree_path.join(filename), content).unwrap();
        let repo = Repository::open(worktree_path).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(filename)).unwrap();
        index.write().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = repo.signature().unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap();
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn spawn(
        &self,
        worker_id: &str,
        _feature: &str,
        worktree_path: &Path,
        _branch: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, LaunchError> {
        let (task_id, dsl) = read_assignment(env);

        if let Some(file) = dsl.strip_prefix("stall-then-create:") {
            let attempt = self.bump_attempt(&task_id);
            if attempt == 1 {
                self.stalled_workers.lock().unwrap().insert(worker_id.to_string());
            } else {
                self.commit_file(worktree_path, file, "worker: create file after retry");
                self.outcomes_by_worker
                    .lock()
                    .unwrap()
                    .insert(worker_id.to_string(), WorkerOutcome::Succeeded);
            }
        } else if let Some(file) = dsl.strip_prefix("checkpoint-then-create:") {
            let attempt = self.bump_attempt(&task_id);
            if attempt == 1 {
                self.commit_file(worktree_path, "WIP.marker", "worker: checkpoint wip");
                self.outcomes_by_worker
                    .lock()
                    .unwrap()
                    .insert(worker_id.to_string(), WorkerOutcome::Checkpointed);
            } else {
                self.commit_file(worktree_path, file, "worker: create file after resume");
                self.outcomes_by_worker
                    .lock()
                    .unwrap()
                    .insert(worker_id.to_string(), WorkerOutcome::Succeeded);
            }
        } else if let Some(file) = dsl.strip_prefix("conflicting-edit:") {
            self.commit_file(worktree_path, file, "worker: create file");
            self.commit_change(
                worktree_path,
                "shared.txt",
                &format!("edited by worker {worker_id}\n"),
                "worker: edit shared.txt",
            );
            self.outcomes_by_worker
                .lock()
                .unwrap()
                .insert(worker_id.to_string(), WorkerOutcome::Succeeded);
        } else if let Some(files) = dsl.strip_prefix("create:") {
            for file in files.split(',').filter(|s| !s.is_empty()) {
                self.commit_file(worktree_path, file, "worker: create file");
            }
            self.outcomes_by_worker
                .lock()
                .unwrap()
                .insert(worker_id.to_string(), WorkerOutcome::Succeeded);
        } else {
            self.outcomes_by_worker
                .lock()
                .unwrap()
                .insert(worker_id.to_string(), WorkerOutcome::Succeeded);
        }

        Ok(worker_id.to_string())
    }

    async fn poll(&self, worker_id: &str, _handle: &str) -> Result<Option<WorkerOutcome>, LaunchError> {
        if self.stalled_workers.lock().unwrap().contains(worker_id) {
            return Ok(None);
        }
        Ok(self.outcomes_by_worker.lock().unwrap().get(worker_id).copied())
    }

    async fn terminate(&self, worker_id: &str, _handle: &str) -> Result<(), LaunchError> {
        self.stalled_workers.lock().unwrap().remove(worker_id);
        Ok(())
    }

    async fn kill(&self, worker_id: &str, _handle: &str) -> Result<(), LaunchError> {
        self.stalled_workers.lock().unwrap().remove(worker_id);
        Ok(())
    }

    async fn output(&self, worker_id: &str, _handle: &str) -> Result<String, LaunchError> {
        Ok(format!(".mahabharatha/logs/{worker_id}.log"))
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}

fn init_repo(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
    }
    fs::write(dir.join("README.md"), "hello\n").unwrap();
    fs::write(dir.join("shared.txt"), "original\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.add_path(Path::new("shared.txt")).unwrap();
    index.write().unwrap();
    let tree_oid = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = repo.signature().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
}

fn task(id: &str, deps: &[&str], dsl: &str, creates: &[&str], verification: Option<Verification>) -> Task {
    Task {
        id: id.to_string(),
        title: id.to_string(),
        description: String::new(),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        files: TaskFiles {
            create: creates.iter().map(PathBuf::from).collect(),
            modify: Vec::new(),
            read: Vec::new(),
        },
        verification,
        level: None,
        consumers: Vec::new(),
        integration_test: None,
        context: Some(serde_json::Value::String(dsl.to_string())),
    }
}

fn doc(feature: &str, tasks: Vec<Task>) -> TaskGraphDocument {
    TaskGraphDocument {
        feature: feature.to_string(),
        version: TASK_GRAPH_SCHEMA_VERSION.to_string(),
        total_tasks: tasks.len(),
        tasks,
        levels: HashMap::new(),
    }
}

/// Writes the document to `<repo>/.mahabharatha/graph.json`, matching how
/// `main`'s `run` subcommand hands `LevelController` the same path it loaded
/// the graph from, and returns that path.
fn write_graph(repo_root: &Path, document: &TaskGraphDocument) -> PathBuf {
    let path = repo_root.join(".mahabharatha").join("graph.json");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, serde_json::to_vec_pretty(document).unwrap()).unwrap();
    path
}

fn test_config(gates: Vec<GateSpec>, stall_timeout_secs: u64) -> OrchestratorConfig {
    OrchestratorConfig {
        launcher: Default::default(),
        concurrency: ConcurrencyConfig { max_workers: Some(4) },
        heartbeat: HeartbeatConfig {
            stall_timeout_secs: Some(stall_timeout_secs),
            terminate_grace_ms: Some(5),
        },
        retry: RetryPolicy {
            max_attempts: Some(3),
            base_delay_ms: Some(1),
            max_delay_ms: Some(2),
        },
        ports: PortRangeConfig {
            start: Some(4000),
            end: Some(4010),
        },
        gates,
        version: "1".to_string(),
    }
}

fn base_tree_has_file(repo_root: &Path, feature: &str, filename: &str) -> bool {
    let repo = Repository::open(repo_root).unwrap();
    let branch = repo
        .find_branch(&base_branch(feature), git2::BranchType::Local)
        .unwrap();
    let tree = branch.get().peel_to_commit().unwrap().tree().unwrap();
    tree.get_path(Path::new(filename)).is_ok()
}

fn tag_exists(repo_root: &Path, tag_name: &str) -> bool {
    let repo = Repository::open(repo_root).unwrap();
    repo.find_reference(&format!("refs/tags/{tag_name}")).is_ok()
}

#[tokio::test]
async fn s1_trivial_linear_completes_both_levels_and_tags_base() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let document = doc(
        "widget-export",
        vec![
            task("t1", &[], "create:a.txt", &["a.txt"], None),
            task("t2", &["t1"], "create:b.txt", &["b.txt"], None),
        ],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    let cfg = test_config(
        vec![GateSpec {
            name: "sanity".into(),
            command: "true".into(),
            args: vec![],
            required: true,
            timeout_seconds: 5,
        }],
        120,
    );

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    controller.run().await.unwrap();

    assert!(base_tree_has_file(dir.path(), "widget-export", "a.txt"));
    assert!(base_tree_has_file(dir.path(), "widget-export", "b.txt"));
    assert!(tag_exists(dir.path(), &level_complete_tag("widget-export", 0)));
    assert!(tag_exists(dir.path(), &level_complete_tag("widget-export", 1)));

    let state_dir = StateStore::default_dir(dir.path());
    let state = StateStore::new(state_dir, "widget-export").load().unwrap();
    assert_eq!(state.tasks["t1"].status, TaskStatus::Completed);
    assert_eq!(state.tasks["t2"].status, TaskStatus::Completed);
    assert_eq!(state.levels[0].status, LevelStatus::Complete);
    assert_eq!(state.levels[1].status, LevelStatus::Complete);

    let messages: Vec<&str> = state.events.iter().map(|e| e.message.as_str()).collect();
    let level0_complete = messages.iter().position(|m| m.contains("level 0 complete")).unwrap();
    let t2_dispatched = messages
        .iter()
        .position(|m| m.contains("task t2 dispatched"))
        .unwrap();
    assert!(level0_complete < t2_dispatched, "level 0 must merge before t2 starts");
}

#[tokio::test]
async fn s2_parallel_tasks_within_a_level_both_land_before_next_level_starts() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let document = doc(
        "widget-export",
        vec![
            task("t1", &[], "create:a.txt", &["a.txt"], None),
            task("t2", &[], "create:b.txt", &["b.txt"], None),
            task("t3", &["t1", "t2"], "create:c.txt", &["c.txt"], None),
        ],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    let cfg = test_config(vec![], 120);

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    controller.run().await.unwrap();

    assert!(base_tree_has_file(dir.path(), "widget-export", "a.txt"));
    assert!(base_tree_has_file(dir.path(), "widget-export", "b.txt"));
    assert!(base_tree_has_file(dir.path(), "widget-export", "c.txt"));
    assert!(tag_exists(dir.path(), &level_complete_tag("widget-export", 0)));
    assert!(tag_exists(dir.path(), &level_complete_tag("widget-export", 1)));
}

#[tokio::test]
async fn s3_stalled_worker_is_retried_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let document = doc(
        "widget-export",
        vec![task("t1", &[], "stall-then-create:a.txt", &["a.txt"], None)],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    // A zero-second stall timeout makes the very first poll observe a stall
    // deterministically, instead of a real sleep-based race.
    let cfg = test_config(vec![], 0);

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    controller.run().await.unwrap();

    assert!(base_tree_has_file(dir.path(), "widget-export", "a.txt"));

    let state_dir = StateStore::default_dir(dir.path());
    let state = StateStore::new(state_dir.clone(), "widget-export").load().unwrap();
    assert_eq!(state.tasks["t1"].status, TaskStatus::Completed);
    assert_eq!(state.tasks["t1"].attempts, 1);

    let messages: Vec<&str> = state.events.iter().map(|e| e.message.as_str()).collect();
    let failed_idx = messages
        .iter()
        .position(|m| m.contains("failed (stall/crash)"))
        .expect("a stall/crash failure event must be recorded");
    let completed_idx = messages
        .iter()
        .position(|m| m.contains("task t1 completed"))
        .expect("the retried task must eventually complete");
    assert!(failed_idx < completed_idx);

    let escalations = EscalationStore::new(state_dir, "widget-export").unresolved().unwrap();
    assert!(escalations.is_empty(), "a retryable stall must not escalate");
}

#[tokio::test]
async fn s4_gate_failure_rolls_back_and_leaves_base_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let document = doc(
        "widget-export",
        vec![task("t1", &[], "create:a.txt", &["a.txt"], None)],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    let cfg = test_config(
        vec![GateSpec {
            name: "required-check".into(),
            command: "false".into(),
            args: vec![],
            required: true,
            timeout_seconds: 5,
        }],
        120,
    );

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        crate::errors::OrchestratorError::LevelFailed { level: 0 }
    ));

    assert!(!base_tree_has_file(dir.path(), "widget-export", "a.txt"));
    assert!(!tag_exists(dir.path(), &level_complete_tag("widget-export", 0)));

    let state_dir = StateStore::default_dir(dir.path());
    let state = StateStore::new(state_dir, "widget-export").load().unwrap();
    assert_eq!(state.levels[0].status, LevelStatus::RolledBack);
}

#[tokio::test]
async fn s5_checkpoint_then_resume_completes_without_a_duplicate_final_commit() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let document = doc(
        "widget-export",
        vec![task("t1", &[], "checkpoint-then-create:a.txt", &["a.txt"], None)],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    let cfg = test_config(vec![], 120);

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    controller.run().await.unwrap();

    assert!(base_tree_has_file(dir.path(), "widget-export", "a.txt"));
    assert!(base_tree_has_file(dir.path(), "widget-export", "WIP.marker"));

    let state_dir = StateStore::default_dir(dir.path());
    let state = StateStore::new(state_dir, "widget-export").load().unwrap();
    assert_eq!(state.tasks["t1"].status, TaskStatus::Completed);

    let messages: Vec<&str> = state.events.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("checkpointed")));
    assert!(messages.iter().any(|m| m.contains("resumed from checkpoint")));

    // Exactly one worker commit per attempt: the checkpoint WIP commit and
    // the post-resume completion commit, no redundant replays of either.
    let repo = Repository::open(dir.path()).unwrap();
    let branch = repo
        .find_branch(
            &crate::worktree::worker_branch("widget-export", "1"),
            git2::BranchType::Local,
        )
        .unwrap();
    let mut commit = branch.get().peel_to_commit().unwrap();
    let mut messages_on_branch = Vec::new();
    loop {
        messages_on_branch.push(commit.message().unwrap_or_default().to_string());
        if commit.parent_count() == 0 {
            break;
        }
        commit = commit.parent(0).unwrap();
        if messages_on_branch.len() > 10 {
            break;
        }
    }
    let worker_commits = messages_on_branch
        .iter()
        .filter(|m| m.starts_with("worker:"))
        .count();
    assert_eq!(worker_commits, 2, "expected one checkpoint commit and one resume commit, got: {messages_on_branch:?}");
}

#[tokio::test]
async fn s6_merge_conflict_rolls_back_and_escalates() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    // t1 and t2 share no declared files, so graph validation admits them
    // into the same level, but each worker also edits `shared.txt` (not
    // declared to either task) with different content — an incidental
    // collision real-world workers can hit even when ownership is
    // correctly partitioned on paper.
    let document = doc(
        "widget-export",
        vec![
            task("t1", &[], "conflicting-edit:a.txt", &["a.txt"], None),
            task("t2", &[], "conflicting-edit:b.txt", &["b.txt"], None),
        ],
    );
    let graph_path = write_graph(dir.path(), &document);
    let graph = TaskGraph::from_document(document).unwrap();
    let cfg = test_config(vec![], 120);

    let launcher = Box::new(FakeLauncher::new());
    let mut controller =
        LevelController::new(&graph, "widget-export", dir.path().to_path_buf(), graph_path, launcher, &cfg);
    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        crate::errors::OrchestratorError::LevelFailed { level: 0 }
    ));

    // Neither worker's file lands: the conflict rolls staging back to base
    // before any fast-forward happens.
    assert!(!base_tree_has_file(dir.path(), "widget-export", "a.txt"));
    assert!(!base_tree_has_file(dir.path(), "widget-export", "b.txt"));
    assert!(!tag_exists(dir.path(), &level_complete_tag("widget-export", 0)));

    let state_dir = StateStore::default_dir(dir.path());
    let state = StateStore::new(state_dir.clone(), "widget-export").load().unwrap();
    assert_eq!(state.levels[0].status, LevelStatus::RolledBack);

    let escalations = EscalationStore::new(state_dir, "widget-export").unresolved().unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].cause, crate::state::EscalationCause::MergeConflict);
}
