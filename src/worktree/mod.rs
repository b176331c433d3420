// SPDX-License-Identifier: MIT

//! Isolation substrate: one git worktree and branch per worker, plus the
//! shared `base` and `staging` branches the merge coordinator integrates
//! into. Branch names follow `mahabharatha/<feature>/<role>` throughout.

use std::path::{Path, PathBuf};

use git2::{Repository, WorktreeAddOptions};

use crate::errors::WorktreeError;

pub fn base_branch(feature: &str) -> String {
    format!("mahabharatha/{feature}/base")
}

pub fn staging_branch(feature: &str) -> String {
    format!("mahabharatha/{feature}/staging")
}

pub fn worker_branch(feature: &str, worker_id: &str) -> String {
    format!("mahabharatha/{feature}/worker-{worker_id}")
}

pub fn level_complete_tag(feature: &str, level: usize) -> String {
    format!("{feature}/level-{level}-complete")
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let worktrees_dir = repo_root.join(".mahabharatha").join("worktrees");
        Self {
            repo_root,
            worktrees_dir,
        }
    }

    fn repo(&self) -> Result<Repository, WorktreeError> {
        Ok(Repository::open(&self.repo_root)?)
    }

    /// Create `base` and `staging` branches off the current HEAD if they do
    /// not already exist. Called once per feature before any worker starts.
    pub fn ensure_base_branches(&self, feature: &str) -> Result<(), WorktreeError> {
        let repo = self.repo()?;
        let head_commit = repo.head()?.peel_to_commit()?;

        for branch_name in [base_branch(feature), staging_branch(feature)] {
            if repo.find_branch(&branch_name, git2::BranchType::Local).is_err() {
                repo.branch(&branch_name, &head_commit, false)?;
            }
        }
        Ok(())
    }

    pub fn worker_path(&self, feature: &str, worker_id: &str) -> PathBuf {
        self.worktrees_dir.join(feature).join(worker_id)
    }

    /// Create an isolated worktree for `worker_id`, branched off `base`.
    /// Idempotent for a given `(feature, worker_id)` (spec §4.3): if the
    /// worktree already exists — the common case on orchestrator restart,
    /// where the crashed run's worker ids are reused — this returns the
    /// existing `{path, branch}` instead of erroring.
    pub fn create_worker_worktree(
        &self,
        feature: &str,
        worker_id: &str,
    ) -> Result<(PathBuf, String), WorktreeError> {
        let path = self.worker_path(feature, worker_id);
        let branch_name = worker_branch(feature, worker_id);

        if path.exists() {
            return Ok((path, branch_name));
        }

        let repo = self.repo()?;
        let base = repo.find_branch(&base_branch(feature), git2::BranchType::Local)?;
        let base_commit = base.get().peel_to_commit()?;
        let branch = match repo.find_branch(&branch_name, git2::BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => repo.branch(&branch_name, &base_commit, false)?,
        };
        let reference = branch.into_reference();

        std::fs::create_dir_all(path.parent().expect("worker path has a parent"))
            .map_err(|_| WorktreeError::NotFound {
                worker_id: worker_id.to_string(),
            })?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(worker_id, &path, Some(&opts))?;

        Ok((path, branch_name))
    }

    /// Remove a worker's worktree. Refuses if the working copy has
    /// uncommitted changes unless `force` is set (the orchestrator's
    /// `cleanup` command with `--force` per spec §4.8).
    pub fn prune_worker_worktree(
        &self,
        feature: &str,
        worker_id: &str,
        force: bool,
    ) -> Result<(), WorktreeError> {
        let path = self.worker_path(feature, worker_id);
        if !path.exists() {
            return Err(WorktreeError::NotFound {
                worker_id: worker_id.to_string(),
            });
        }

        if !force {
            let worktree_repo = Repository::open(&path)?;
            let statuses = worktree_repo.statuses(None)?;
            if !statuses.is_empty() {
                return Err(WorktreeError::DirtyWorktree { path });
            }
        }

        let repo = self.repo()?;
        if let Ok(wt) = repo.find_worktree(worker_id) {
            wt.prune(None)?;
        }
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        Ok(())
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        (dir, repo)
    }

    #[test]
    fn branch_names_follow_the_feature_role_convention() {
        assert_eq!(base_branch("widget-export"), "mahabharatha/widget-export/base");
        assert_eq!(staging_branch("widget-export"), "mahabharatha/widget-export/staging");
        assert_eq!(worker_branch("widget-export", "w1"), "mahabharatha/widget-export/worker-w1");
        assert_eq!(level_complete_tag("widget-export", 2), "widget-export/level-2-complete");
    }

    #[test]
    fn ensure_base_branches_is_idempotent() {
        let (dir, repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        manager.ensure_base_branches("widget-export").unwrap();
        manager.ensure_base_branches("widget-export").unwrap();

        assert!(repo
            .find_branch(&base_branch("widget-export"), git2::BranchType::Local)
            .is_ok());
        assert!(repo
            .find_branch(&staging_branch("widget-export"), git2::BranchType::Local)
            .is_ok());
    }

    #[test]
    fn create_worker_worktree_branches_off_base() {
        let (dir, _repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        manager.ensure_base_branches("widget-export").unwrap();

        let (path, branch) = manager.create_worker_worktree("widget-export", "w1").unwrap();
        assert!(path.exists());
        assert!(path.join("README.md").exists());
        assert_eq!(branch, "mahabharatha/widget-export/worker-w1");
    }

    #[test]
    fn create_worker_worktree_is_idempotent_for_the_same_worker_id() {
        let (dir, _repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        manager.ensure_base_branches("widget-export").unwrap();
        let (first_path, first_branch) = manager.create_worker_worktree("widget-export", "w1").unwrap();

        let (second_path, second_branch) = manager.create_worker_worktree("widget-export", "w1").unwrap();
        assert_eq!(first_path, second_path);
        assert_eq!(first_branch, second_branch);
        assert!(second_path.exists());
    }

    #[test]
    fn prune_worker_worktree_removes_a_clean_worktree() {
        let (dir, _repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        manager.ensure_base_branches("widget-export").unwrap();
        let (path, _branch) = manager.create_worker_worktree("widget-export", "w1").unwrap();
        assert!(path.exists());

        manager.prune_worker_worktree("widget-export", "w1", false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn prune_worker_worktree_refuses_a_dirty_worktree_without_force() {
        let (dir, _repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        manager.ensure_base_branches("widget-export").unwrap();
        let (path, _branch) = manager.create_worker_worktree("widget-export", "w1").unwrap();
        fs::write(path.join("new_file.txt"), "uncommitted\n").unwrap();

        let err = manager
            .prune_worker_worktree("widget-export", "w1", false)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::DirtyWorktree { .. }));
        assert!(path.exists());

        manager.prune_worker_worktree("widget-export", "w1", true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn prune_worker_worktree_errors_when_no_such_worker_exists() {
        let (dir, _repo) = init_repo();
        let manager = WorktreeManager::new(dir.path());
        let err = manager
            .prune_worker_worktree("widget-export", "ghost", false)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::NotFound { .. }));
    }
}
