use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::command::GitCli;

pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("tiller-git-{prefix}-{now}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

pub fn test_git() -> GitCli {
    GitCli::default().with_identity("Test User", "test@example.com")
}

pub fn run_git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test User", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Fresh repository on branch `main` with a single commit.
pub fn init_repo(prefix: &str) -> PathBuf {
    let root = unique_temp_dir(prefix).join("repo");
    fs::create_dir_all(&root).expect("create repo dir");
    run_git(&root, &["init"]);
    run_git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    fs::write(root.join("README.md"), "init\n").expect("write file");
    run_git(&root, &["add", "README.md"]);
    run_git(&root, &["commit", "-m", "init"]);
    root
}

pub fn commit_file(cwd: &Path, file: &str, body: &str, message: &str) {
    fs::write(cwd.join(file), body).expect("write file");
    run_git(cwd, &["add", file]);
    run_git(cwd, &["commit", "-m", message]);
}

pub fn commit_count(cwd: &Path, rev: &str) -> usize {
    run_git(cwd, &["rev-list", "--count", rev])
        .trim()
        .parse()
        .expect("numeric count")
}

/// Remove the scratch parent of a repo created by [`init_repo`].
pub fn cleanup(repo_root: &Path) {
    if let Some(parent) = repo_root.parent() {
        let _ = fs::remove_dir_all(parent);
    }
}
