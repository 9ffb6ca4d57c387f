use std::path::{Path, PathBuf};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub root: PathBuf,
    pub git_dir: PathBuf,
}

pub fn discover_repo(start_path: &Path, git: &GitCli) -> Result<RepoHandle, GitError> {
    let inside = match git.run(start_path, ["rev-parse", "--is-inside-work-tree"]) {
        Ok(output) => output.stdout.trim().eq("true"),
        Err(GitError::CommandFailed { .. }) => false,
        Err(err) => return Err(err),
    };

    if !inside {
        return Err(GitError::NotARepository {
            path: start_path.to_path_buf(),
        });
    }

    let root_raw = git.run(start_path, ["rev-parse", "--show-toplevel"])?;
    let root = PathBuf::from(root_raw.stdout.trim());

    let git_dir_raw = git.run(&root, ["rev-parse", "--git-common-dir"])?;
    let git_dir_rel = PathBuf::from(git_dir_raw.stdout.trim());
    let git_dir = if git_dir_rel.is_absolute() {
        git_dir_rel
    } else {
        root.join(git_dir_rel)
    };

    Ok(RepoHandle { root, git_dir })
}

pub fn current_branch(repo: &RepoHandle, git: &GitCli) -> Result<String, GitError> {
    let output = git.run(&repo.root, ["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(output.stdout.trim().to_string())
}

pub fn head_sha(repo: &RepoHandle, git: &GitCli) -> Result<String, GitError> {
    rev_parse(&repo.root, "HEAD", git)
}

pub fn rev_parse(cwd: &Path, rev: &str, git: &GitCli) -> Result<String, GitError> {
    let output = git.run(cwd, ["rev-parse", "--verify", rev])?;
    Ok(output.stdout.trim().to_string())
}

/// Check if the worktree has uncommitted changes (staged, unstaged or untracked).
pub fn has_uncommitted_changes(repo: &RepoHandle, git: &GitCli) -> Result<bool, GitError> {
    let output = git.run(&repo.root, ["status", "--porcelain"])?;
    Ok(!output.stdout.trim().is_empty())
}

pub fn branch_exists(repo: &RepoHandle, branch: &str, git: &GitCli) -> Result<bool, GitError> {
    let reference = format!("refs/heads/{branch}");
    git.probe(&repo.root, ["show-ref", "--verify", "--quiet", reference.as_str()])
}

pub fn create_branch(
    repo: &RepoHandle,
    branch: &str,
    base: &str,
    git: &GitCli,
) -> Result<(), GitError> {
    if !branch_exists(repo, base, git)? {
        return Err(GitError::BranchNotFound {
            branch: base.to_string(),
        });
    }
    git.run(&repo.root, ["branch", branch, base])?;
    Ok(())
}

/// Delete a local branch. `force` drops it even when unmerged, which is the
/// normal case after a squash merge.
pub fn delete_branch(
    repo: &RepoHandle,
    branch: &str,
    force: bool,
    git: &GitCli,
) -> Result<(), GitError> {
    let flag = if force { "-D" } else { "-d" };
    git.run(&repo.root, ["branch", flag, branch])?;
    Ok(())
}

pub fn list_branches(
    repo: &RepoHandle,
    prefix: &str,
    git: &GitCli,
) -> Result<Vec<String>, GitError> {
    let pattern = format!("refs/heads/{prefix}");
    let output = git.run(
        &repo.root,
        ["for-each-ref", "--format=%(refname:short)", pattern.as_str()],
    )?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Number of commits reachable from `head` but not from `base`.
pub fn count_commits_between(
    cwd: &Path,
    base: &str,
    head: &str,
    git: &GitCli,
) -> Result<usize, GitError> {
    let range = format!("{base}..{head}");
    let output = git.run(cwd, ["rev-list", "--count", range.as_str()])?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|_| GitError::Parse {
            context: format!("rev-list --count returned '{}'", output.stdout.trim()),
        })
}

/// Stage everything in `cwd` and commit it. Returns the new HEAD, or `None`
/// when there was nothing to commit.
pub fn commit_all(cwd: &Path, message: &str, git: &GitCli) -> Result<Option<String>, GitError> {
    git.run(cwd, ["add", "-A"])?;
    if git.probe(cwd, ["diff", "--cached", "--quiet"])? {
        return Ok(None);
    }
    git.run(cwd, ["commit", "--no-verify", "-m", message])?;
    rev_parse(cwd, "HEAD", git).map(Some)
}
