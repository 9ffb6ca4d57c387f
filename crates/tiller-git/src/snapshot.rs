use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::count_commits_between;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Unmerged,
    Untracked,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: PathBuf,
    pub state: FileState,
    pub status_code: String,
}

/// Point-in-time state of one working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeStatus {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub clean: bool,
    /// Commits on the checked-out branch that `base` does not have.
    pub ahead_count: usize,
    pub changed_files: Vec<ChangedFile>,
}

impl WorktreeStatus {
    pub fn changed_paths(&self) -> Vec<String> {
        self.changed_files
            .iter()
            .map(|file| file.path.to_string_lossy().into_owned())
            .collect()
    }
}

pub fn worktree_status(
    path: &Path,
    base: Option<&str>,
    git: &GitCli,
) -> Result<WorktreeStatus, GitError> {
    let output = git.run(path, ["status", "--porcelain=v1", "--untracked-files=all"])?;
    let changed_files = parse_porcelain_status(&output.stdout)?;

    let branch = match git.run(path, ["symbolic-ref", "--quiet", "--short", "HEAD"]) {
        Ok(output) => Some(output.stdout.trim().to_string()),
        Err(GitError::CommandFailed { .. }) => None,
        Err(err) => return Err(err),
    };

    let ahead_count = match base {
        Some(base) => count_commits_between(path, base, "HEAD", git)?,
        None => 0,
    };

    Ok(WorktreeStatus {
        path: path.to_path_buf(),
        branch,
        clean: changed_files.is_empty(),
        ahead_count,
        changed_files,
    })
}

/// Modified tracked paths, ignoring untracked files. These are the changes
/// a merge or reset in this checkout could clobber.
pub fn tracked_changes(path: &Path, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(path, ["status", "--porcelain=v1", "--untracked-files=no"])?;
    Ok(parse_porcelain_status(&output.stdout)?
        .into_iter()
        .map(|file| file.path.to_string_lossy().into_owned())
        .collect())
}

/// Paths left unmerged by a stopped merge, squash or rebase.
pub fn conflicted_files(path: &Path, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(path, ["diff", "--name-only", "--diff-filter=U"])?;
    let mut files: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

fn parse_porcelain_status(raw: &str) -> Result<Vec<ChangedFile>, GitError> {
    let mut files = Vec::new();

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if line.len() < 4 {
            return Err(GitError::Parse {
                context: format!("invalid porcelain status line: {line}"),
            });
        }

        let code = &line[0..2];
        let raw_path = &line[3..];
        // Renames and copies report `old -> new`; the new path is the live one.
        let path = raw_path
            .rsplit_once(" -> ")
            .map(|(_, new)| new)
            .unwrap_or(raw_path);

        files.push(ChangedFile {
            path: PathBuf::from(path.trim_matches('"')),
            state: file_state_from_code(code),
            status_code: code.to_string(),
        });
    }

    Ok(files)
}

fn file_state_from_code(code: &str) -> FileState {
    if code == "??" {
        return FileState::Untracked;
    }
    if code.contains('U') || code == "AA" || code == "DD" {
        return FileState::Unmerged;
    }
    if code.contains('A') {
        return FileState::Added;
    }
    if code.contains('M') {
        return FileState::Modified;
    }
    if code.contains('D') {
        return FileState::Deleted;
    }
    if code.contains('R') {
        return FileState::Renamed;
    }
    if code.contains('C') {
        return FileState::Copied;
    }
    FileState::Unknown
}
