// SPDX-License-Identifier: MIT

pub mod cache;
pub mod gate;

use std::collections::HashMap;

use chrono::Utc;
use git2::{MergeOptions, Repository};

use crate::errors::MergeError;
use crate::merge::gate::{GateSpec, GateVerdict};
use crate::observability::messages::merge::{GateRan, LevelMergeStarted, LevelRolledBack};
use crate::observability::messages::StructuredLog;
use crate::state::{GateOutcome, GateResult};
use crate::worktree::{level_complete_tag, staging_branch, worker_branch, WorktreeManager};

pub struct MergeCoordinator<'a> {
    worktrees: &'a WorktreeManager,
    config_version: String,
}

pub struct MergeOutcome {
    pub gate_results: Vec<GateResult>,
    pub succeeded: bool,
    pub conflict: Option<MergeConflict>,
}

/// A worker branch that could not be integrated into staging, surfaced as
/// a value rather than an error so the caller can roll back and escalate
/// in one place instead of unwinding past `rollback_level`.
pub struct MergeConflict {
    pub branch: String,
    pub target: String,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(worktrees: &'a WorktreeManager, config_version: impl Into<String>) -> Self {
        Self {
            worktrees,
            config_version: config_version.into(),
        }
    }

    /// Fast-forward merge every completed worker branch for `level` into
    /// the staging branch. A real conflict (not fast-forwardable, and
    /// `git2`'s merge analysis reports actual content conflicts) aborts
    /// the whole level per spec's "no partial merges" non-goal.
    fn integrate_worker_branches(
        &self,
        feature: &str,
        level: usize,
        worker_ids: &[String],
    ) -> Result<(), MergeError> {
        let repo = Repository::open(self.worktrees.repo_root())?;
        let staging_ref = staging_branch(feature);

        repo.set_head(&format!("refs/heads/{staging_ref}"))?;
        repo.checkout_head(None)?;

        LevelMergeStarted {
            level,
            branch_count: worker_ids.len(),
        }
        .log();

        for worker_id in worker_ids {
            let branch_ref = worker_branch(feature, worker_id);
            let annotated = repo.find_branch(&branch_ref, git2::BranchType::Local)?;
            let annotated_commit = repo.reference_to_annotated_commit(annotated.get())?;

            let (analysis, _) = repo.merge_analysis(&[&annotated_commit])?;
            if analysis.is_up_to_date() {
                continue;
            }
            if !analysis.is_fast_forward() && !analysis.is_normal() {
                return Err(MergeError::Conflict {
                    branch: branch_ref,
                    target: staging_ref,
                });
            }

            let mut merge_opts = MergeOptions::new();
            repo.merge(&[&annotated_commit], Some(&mut merge_opts), None)?;

            let mut index = repo.index()?;
            if index.has_conflicts() {
                repo.cleanup_state()?;
                return Err(MergeError::Conflict {
                    branch: branch_ref,
                    target: staging_ref,
                });
            }

            let tree_oid = index.write_tree()?;
            let tree = repo.find_tree(tree_oid)?;
            let sig = repo.signature()?;
            let head_commit = repo.head()?.peel_to_commit()?;
            let worker_commit = annotated.get().peel_to_commit()?;
            repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &format!("merge {branch_ref} into {staging_ref}"),
                &tree,
                &[&head_commit, &worker_commit],
            )?;
            repo.cleanup_state()?;
        }

        Ok(())
    }

    /// Integrate worker branches, then run every gate (using the cache
    /// where the fingerprint is unchanged), returning whether the level may
    /// be promoted.
    pub async fn merge_level(
        &self,
        feature: &str,
        level: usize,
        worker_ids: &[String],
        gates: &[GateSpec],
        previous_cache: &HashMap<String, GateResult>,
    ) -> Result<MergeOutcome, MergeError> {
        if worker_ids.is_empty() {
            return Err(MergeError::NothingToMerge { level });
        }

        if let Err(err) = self.integrate_worker_branches(feature, level, worker_ids) {
            return match err {
                MergeError::Conflict { branch, target } => {
                    self.rollback_level(
                        feature,
                        level,
                        &format!("merge conflict integrating {branch} into {target}"),
                    )?;
                    Ok(MergeOutcome {
                        gate_results: Vec::new(),
                        succeeded: false,
                        conflict: Some(MergeConflict { branch, target }),
                    })
                }
                other => Err(other),
            };
        }

        let staging_path = self.worktrees.repo_root();
        let mut results = Vec::new();
        let mut blocked = false;

        for gate_spec in gates {
            let fp = cache::fingerprint(staging_path, gate_spec, &self.config_version)?;

            if let Some(cached) = cache::lookup(previous_cache, &gate_spec.name, &fp) {
                GateRan {
                    gate_name: &gate_spec.name,
                    passed: true,
                    cached: true,
                }
                .log();
                results.push(cached.clone());
                continue;
            }

            let outcome = gate::run_gate(gate_spec, staging_path).await?;
            let blocks = outcome.blocks_merge(gate_spec.required);
            GateRan {
                gate_name: &gate_spec.name,
                passed: outcome.verdict == GateVerdict::Pass,
                cached: false,
            }
            .log();

            let state_outcome = match outcome.verdict {
                GateVerdict::Pass => GateOutcome::Pass,
                GateVerdict::Fail => GateOutcome::Fail,
                GateVerdict::Timeout => GateOutcome::Timeout,
            };

            results.push(GateResult {
                gate_name: gate_spec.name.clone(),
                outcome: state_outcome,
                exit_code: outcome.exit_code,
                log_path: format!(".mahabharatha/logs/gate-{}-level-{level}.log", gate_spec.name),
                fingerprint: fp,
                ran_at: Utc::now(),
            });

            if blocks {
                blocked = true;
                break;
            }
        }

        if blocked {
            self.rollback_level(feature, level, "a required quality gate failed")?;
        } else {
            self.finalize_level(feature, level)?;
        }

        Ok(MergeOutcome {
            gate_results: results,
            succeeded: !blocked,
            conflict: None,
        })
    }

    /// Fast-forward `base` to `staging` and tag the result. Spec §4.9's
    /// "idempotent on retry" clause: if a prior run tagged the level but
    /// crashed before updating state, this run observes the existing tag
    /// and skips re-tagging instead of erroring or re-merging.
    fn finalize_level(&self, feature: &str, level: usize) -> Result<(), MergeError> {
        let repo = Repository::open(self.worktrees.repo_root())?;
        let staging = repo.find_branch(&staging_branch(feature), git2::BranchType::Local)?;
        let staging_commit = staging.get().peel_to_commit()?;

        let base_ref = crate::worktree::base_branch(feature);
        let mut base = repo.find_branch(&base_ref, git2::BranchType::Local)?;
        base.get_mut().set_target(staging_commit.id(), "fast-forward base to staging")?;

        let tag_name = level_complete_tag(feature, level);
        if repo.find_reference(&format!("refs/tags/{tag_name}")).is_ok() {
            return Ok(());
        }

        let sig = repo.signature()?;
        repo.tag(
            &tag_name,
            staging_commit.as_object(),
            &sig,
            &format!("level {level} complete"),
            false,
        )?;
        Ok(())
    }

    fn rollback_level(&self, feature: &str, level: usize, reason: &str) -> Result<(), MergeError> {
        LevelRolledBack {
            level,
            reason: reason.to_string(),
        }
        .log();

        let repo = Repository::open(self.worktrees.repo_root())?;
        let base = repo.find_branch(&crate::worktree::base_branch(feature), git2::BranchType::Local)?;
        let base_commit = base.get().peel_to_commit()?;
        let mut staging = repo.find_branch(&staging_branch(feature), git2::BranchType::Local)?;
        staging
            .get_mut()
            .set_target(base_commit.id(), "rollback staging to base")?;
        Ok(())
    }
}
