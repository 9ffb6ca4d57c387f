use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::{branch_exists, RepoHandle};

pub const WORKTREES_DIR: &str = "worktrees";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
    /// Registered in git metadata but the directory is gone.
    pub prunable: bool,
}

/// Creates and removes worktrees under `<haven>/worktrees/<branch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeManager {
    git: GitCli,
    haven: PathBuf,
}

impl WorktreeManager {
    pub fn new(git: GitCli, haven: impl Into<PathBuf>) -> Self {
        Self {
            git,
            haven: haven.into(),
        }
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn haven(&self) -> &Path {
        &self.haven
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.haven.join(WORKTREES_DIR)
    }

    /// `task/T1` lives at `<haven>/worktrees/task/T1`.
    pub fn path_for_branch(&self, branch: &str) -> PathBuf {
        branch
            .split('/')
            .fold(self.worktrees_root(), |path, part| path.join(part))
    }

    /// Cut `branch` from `base` and check it out in a fresh haven worktree.
    pub fn create(
        &self,
        repo: &RepoHandle,
        branch: &str,
        base: &str,
    ) -> Result<WorktreeInfo, GitError> {
        if !branch_exists(repo, base, &self.git)? {
            return Err(GitError::BranchNotFound {
                branch: base.to_string(),
            });
        }
        let path = self.prepare_path(branch)?;
        let args = vec![
            OsString::from("worktree"),
            OsString::from("add"),
            OsString::from("-b"),
            OsString::from(branch),
            path.as_os_str().to_os_string(),
            OsString::from(base),
        ];
        self.git.run(&repo.root, args)?;
        tracing::debug!(branch, base, path = %path.display(), "created worktree");

        Ok(WorktreeInfo {
            branch: branch.to_string(),
            path,
        })
    }

    /// Check out an existing branch in its haven worktree. A directory that is
    /// already a registered worktree for the branch is reused as-is.
    pub fn attach(&self, repo: &RepoHandle, branch: &str) -> Result<WorktreeInfo, GitError> {
        let path = self.path_for_branch(branch);
        if let Some(existing) = self.find_checkout(repo, branch)? {
            if same_path(&existing.path, &path) && path.exists() {
                return Ok(WorktreeInfo {
                    branch: branch.to_string(),
                    path,
                });
            }
        }
        if !branch_exists(repo, branch, &self.git)? {
            return Err(GitError::BranchNotFound {
                branch: branch.to_string(),
            });
        }

        // Stale metadata for a deleted directory blocks `worktree add`.
        self.prune(repo)?;
        let path = self.prepare_path(branch)?;
        let args = vec![
            OsString::from("worktree"),
            OsString::from("add"),
            path.as_os_str().to_os_string(),
            OsString::from(branch),
        ];
        self.git.run(&repo.root, args)?;
        tracing::debug!(branch, path = %path.display(), "attached worktree");

        Ok(WorktreeInfo {
            branch: branch.to_string(),
            path,
        })
    }

    /// Add a throwaway checkout of `branch` at an arbitrary path.
    pub fn add_at(&self, repo: &RepoHandle, path: &Path, branch: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GitError::Fs {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let args = vec![
            OsString::from("worktree"),
            OsString::from("add"),
            path.as_os_str().to_os_string(),
            OsString::from(branch),
        ];
        self.git.run(&repo.root, args)?;
        Ok(())
    }

    /// Remove a worktree. Without `force`, git refuses when it holds
    /// uncommitted changes.
    pub fn remove(&self, repo: &RepoHandle, path: &Path, force: bool) -> Result<(), GitError> {
        let mut args = vec![OsString::from("worktree"), OsString::from("remove")];
        if force {
            args.push(OsString::from("--force"));
        }
        args.push(path.as_os_str().to_os_string());

        match self.git.run(&repo.root, args) {
            Ok(_) => {}
            // Not registered (or already gone): only the directory may be left.
            Err(err @ GitError::CommandFailed { .. }) if force => {
                tracing::debug!(path = %path.display(), stderr = err.stderr(), "worktree remove fell back to directory delete");
                if path.exists() {
                    fs::remove_dir_all(path).map_err(|source| GitError::Fs {
                        path: path.to_path_buf(),
                        source,
                    })?;
                }
                self.prune(repo)?;
            }
            Err(err) => return Err(err),
        }
        self.remove_empty_parents(path);
        Ok(())
    }

    pub fn list(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let output = self.git.run(&repo.root, ["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&output.stdout)
    }

    /// Registered worktrees that live inside this haven.
    pub fn list_haven(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let root = self.worktrees_root();
        let root = fs::canonicalize(&root).unwrap_or(root);
        Ok(self
            .list(repo)?
            .into_iter()
            .filter(|listed| {
                let path = fs::canonicalize(&listed.path).unwrap_or_else(|_| listed.path.clone());
                path.starts_with(&root) || listed.path.starts_with(self.worktrees_root())
            })
            .collect())
    }

    /// Where `branch` is currently checked out, if anywhere.
    pub fn find_checkout(
        &self,
        repo: &RepoHandle,
        branch: &str,
    ) -> Result<Option<ListedWorktree>, GitError> {
        Ok(self
            .list(repo)?
            .into_iter()
            .find(|listed| listed.branch.as_deref() == Some(branch)))
    }

    /// Worktree metadata whose directories no longer exist.
    pub fn stale(&self, repo: &RepoHandle) -> Result<Vec<PathBuf>, GitError> {
        Ok(self
            .list(repo)?
            .into_iter()
            .filter(|listed| listed.prunable || !listed.path.exists())
            .map(|listed| listed.path)
            .collect())
    }

    pub fn prune(&self, repo: &RepoHandle) -> Result<(), GitError> {
        self.git.run(&repo.root, ["worktree", "prune"])?;
        Ok(())
    }

    fn prepare_path(&self, branch: &str) -> Result<PathBuf, GitError> {
        let path = self.path_for_branch(branch);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GitError::Fs {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(path)
    }

    fn remove_empty_parents(&self, path: &Path) {
        let root = self.worktrees_root();
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == root || !dir.starts_with(&root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Path equality that sees through symlinks.
pub fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    let mut listed = Vec::new();

    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut current_head: Option<String> = None;
    let mut current_prunable = false;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                    head: current_head.take(),
                    prunable: std::mem::take(&mut current_prunable),
                });
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
            continue;
        }
        if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.trim().trim_start_matches("refs/heads/").to_string();
            current_branch = Some(branch);
            continue;
        }
        if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.trim().to_string());
            continue;
        }
        if line.starts_with("prunable") {
            current_prunable = true;
        }
    }

    if listed.is_empty() && !raw.trim().is_empty() {
        return Err(GitError::Parse {
            context: "unable to parse git worktree list output".to_string(),
        });
    }

    Ok(listed)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::repo::discover_repo;
    use crate::test_support::{cleanup, init_repo, test_git};

    #[test]
    fn parses_porcelain_worktree_list() {
        let raw = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /haven/worktrees/task/T1\nHEAD def\nbranch refs/heads/task/T1\nprunable gitdir file points to non-existent location\n\nworktree /tmp/detached\nHEAD 123\ndetached\n";
        let listed = parse_worktree_list(raw).expect("parse");
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].branch.as_deref(), Some("main"));
        assert_eq!(listed[1].branch.as_deref(), Some("task/T1"));
        assert!(listed[1].prunable);
        assert_eq!(listed[2].branch, None);
        assert!(!listed[2].prunable);
    }

    #[test]
    fn branch_paths_nest_under_haven() {
        let manager = WorktreeManager::new(GitCli::default(), "/h");
        assert_eq!(
            manager.path_for_branch("task/T1"),
            PathBuf::from("/h/worktrees/task/T1")
        );
    }

    #[test]
    fn create_attach_and_remove_round_trip() {
        let root = init_repo("worktree");
        let git = test_git();
        let repo = discover_repo(&root, &git).expect("discover");
        let haven = root.parent().expect("parent").join("haven");
        let manager = WorktreeManager::new(git.clone(), &haven);

        let info = manager.create(&repo, "task/T1", "main").expect("create");
        assert_eq!(info.path, haven.join("worktrees/task/T1"));
        assert!(info.path.join("README.md").exists());
        assert_eq!(manager.list_haven(&repo).expect("list").len(), 1);

        let again = manager.attach(&repo, "task/T1").expect("reuse checkout");
        assert_eq!(again.path, info.path);

        manager.remove(&repo, &info.path, false).expect("remove");
        assert!(!info.path.exists());
        assert!(manager.list_haven(&repo).expect("list").is_empty());

        let reattached = manager.attach(&repo, "task/T1").expect("reattach");
        assert!(reattached.path.exists());

        cleanup(&root);
    }

    #[test]
    fn create_requires_existing_base_branch() {
        let root = init_repo("worktree-base");
        let git = test_git();
        let repo = discover_repo(&root, &git).expect("discover");
        let manager = WorktreeManager::new(git, root.parent().expect("parent").join("haven"));

        let err = manager
            .create(&repo, "task/T1", "epic/E1")
            .expect_err("missing base");
        assert!(matches!(err, GitError::BranchNotFound { branch } if branch == "epic/E1"));

        cleanup(&root);
    }

    #[test]
    fn forced_remove_and_stale_detection_handle_missing_directories() {
        let root = init_repo("worktree-stale");
        let git = test_git();
        let repo = discover_repo(&root, &git).expect("discover");
        let manager = WorktreeManager::new(git, root.parent().expect("parent").join("haven"));

        let info = manager.create(&repo, "task/T2", "main").expect("create");
        fs::write(info.path.join("dirty.txt"), "x\n").expect("write");
        assert!(manager.remove(&repo, &info.path, false).is_err());

        fs::remove_dir_all(&info.path).expect("delete directory behind git's back");
        assert_eq!(manager.stale(&repo).expect("stale"), vec![info.path.clone()]);

        manager.remove(&repo, &info.path, true).expect("forced remove");
        assert!(manager.stale(&repo).expect("stale").is_empty());

        cleanup(&root);
    }
}
