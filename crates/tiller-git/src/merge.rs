//! Branch-to-branch merges with squash, merge-commit and rebase strategies.
//!
//! Every merge runs in a checkout of the target branch: the worktree where the
//! target is already checked out (which must have no tracked changes), or a
//! throwaway worktree under `<haven>/merge/`. A merge that stops on conflicts
//! is aborted before returning, so the target is either fully merged or left
//! exactly as it was.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tiller_core::MergeStrategy;

use crate::branch::sanitize_ref_component;
use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::{branch_exists, rev_parse, RepoHandle};
use crate::snapshot::{conflicted_files, tracked_changes};
use crate::worktree::WorktreeManager;

pub const MERGE_SCRATCH_DIR: &str = "merge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub source: String,
    pub target: String,
    pub strategy: MergeStrategy,
    pub success: bool,
    pub conflicts: Vec<String>,
    /// Target tip after the attempt; unchanged when conflicts were found.
    pub head: String,
}

struct Checkout {
    path: PathBuf,
    scratch: bool,
}

pub struct Merger<'a> {
    worktrees: &'a WorktreeManager,
}

impl<'a> Merger<'a> {
    pub fn new(worktrees: &'a WorktreeManager) -> Self {
        Self { worktrees }
    }

    fn git(&self) -> &GitCli {
        self.worktrees.git()
    }

    pub fn merge(
        &self,
        repo: &RepoHandle,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome, GitError> {
        for branch in [target, source] {
            if !branch_exists(repo, branch, self.git())? {
                return Err(GitError::BranchNotFound {
                    branch: branch.to_string(),
                });
            }
        }

        let checkout = self.checkout(repo, target)?;
        let attempt = match strategy {
            MergeStrategy::Squash => self.squash(&checkout.path, source, target),
            MergeStrategy::Merge => self.merge_commit(&checkout.path, source, target),
            MergeStrategy::Rebase => self.rebase(repo, &checkout.path, source, target),
        };
        self.release(repo, checkout);
        let conflicts = attempt?;

        let head = rev_parse(&repo.root, &format!("refs/heads/{target}"), self.git())?;
        if conflicts.is_empty() {
            tracing::info!(source, target, %strategy, head = %head, "merged branch");
        } else {
            tracing::warn!(source, target, %strategy, files = ?conflicts, "merge aborted on conflicts");
        }

        Ok(MergeOutcome {
            source: source.to_string(),
            target: target.to_string(),
            strategy,
            success: conflicts.is_empty(),
            conflicts,
            head,
        })
    }

    fn squash(&self, cwd: &Path, source: &str, target: &str) -> Result<Vec<String>, GitError> {
        let git = self.git();
        let range = format!("{target}..{source}");
        let subjects = git.run(cwd, ["log", "--reverse", "--format=%s", range.as_str()])?;

        match git.run(cwd, ["merge", "--squash", source]) {
            Ok(_) => {}
            Err(err @ GitError::CommandFailed { .. }) => {
                let conflicts = conflicted_files(cwd, git)?;
                if conflicts.is_empty() {
                    return Err(err);
                }
                // A squash leaves no MERGE_HEAD, so `merge --abort` has nothing to undo.
                git.run(cwd, ["reset", "--hard", "HEAD"])?;
                return Ok(conflicts);
            }
            Err(err) => return Err(err),
        }

        if git.probe(cwd, ["diff", "--cached", "--quiet"])? {
            return Ok(Vec::new());
        }
        let message = squash_message(source, target, &subjects.stdout);
        git.run(cwd, ["commit", "--no-verify", "-m", message.as_str()])?;
        Ok(Vec::new())
    }

    fn merge_commit(&self, cwd: &Path, source: &str, target: &str) -> Result<Vec<String>, GitError> {
        let git = self.git();
        let message = format!("Merge {source} into {target}");
        match git.run(
            cwd,
            ["merge", "--no-ff", "--no-edit", "-m", message.as_str(), source],
        ) {
            Ok(_) => Ok(Vec::new()),
            Err(err @ GitError::CommandFailed { .. }) => {
                let conflicts = conflicted_files(cwd, git)?;
                if conflicts.is_empty() {
                    return Err(err);
                }
                git.run(cwd, ["merge", "--abort"])?;
                Ok(conflicts)
            }
            Err(err) => Err(err),
        }
    }

    /// Replay `source` onto the target, then fast-forward the target to it.
    fn rebase(
        &self,
        repo: &RepoHandle,
        target_cwd: &Path,
        source: &str,
        target: &str,
    ) -> Result<Vec<String>, GitError> {
        let source_checkout = self.checkout(repo, source)?;
        let attempt = self.rebase_in(&source_checkout.path, target_cwd, source, target);
        self.release(repo, source_checkout);
        attempt
    }

    fn rebase_in(
        &self,
        source_cwd: &Path,
        target_cwd: &Path,
        source: &str,
        target: &str,
    ) -> Result<Vec<String>, GitError> {
        let git = self.git();
        match git.run(source_cwd, ["rebase", target]) {
            Ok(_) => {}
            Err(err @ GitError::CommandFailed { .. }) => {
                let conflicts = conflicted_files(source_cwd, git)?;
                if conflicts.is_empty() {
                    return Err(err);
                }
                git.run(source_cwd, ["rebase", "--abort"])?;
                return Ok(conflicts);
            }
            Err(err) => return Err(err),
        }
        git.run(target_cwd, ["merge", "--ff-only", source])?;
        Ok(Vec::new())
    }

    fn checkout(&self, repo: &RepoHandle, branch: &str) -> Result<Checkout, GitError> {
        let git = self.git();
        if let Some(listed) = self.worktrees.find_checkout(repo, branch)? {
            let files = tracked_changes(&listed.path, git)?;
            if !files.is_empty() {
                return Err(GitError::DirtyWorktree {
                    path: listed.path,
                    files,
                });
            }
            return Ok(Checkout {
                path: listed.path,
                scratch: false,
            });
        }

        let path = self.worktrees.haven().join(MERGE_SCRATCH_DIR).join(format!(
            "{}-{}",
            sanitize_ref_component(&branch.replace('/', "-")),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        self.worktrees.add_at(repo, &path, branch)?;
        Ok(Checkout {
            path,
            scratch: true,
        })
    }

    fn release(&self, repo: &RepoHandle, checkout: Checkout) {
        if !checkout.scratch {
            return;
        }
        if let Err(err) = self.worktrees.remove(repo, &checkout.path, true) {
            tracing::warn!(path = %checkout.path.display(), error = %err, "failed to remove scratch merge worktree");
        }
    }
}

fn squash_message(source: &str, target: &str, subjects: &str) -> String {
    let mut message = format!("Squash merge {source} into {target}");
    let lines: Vec<&str> = subjects
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if !lines.is_empty() {
        message.push_str("\n\n");
        for line in lines {
            message.push_str("- ");
            message.push_str(line);
            message.push('\n');
        }
    }
    message
}
