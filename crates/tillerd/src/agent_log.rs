//! Captured agent output, one plain-text file per task.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tiller_core::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLog {
    dir: PathBuf,
}

impl AgentLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, task_id: &TaskId) -> PathBuf {
        self.dir
            .join(format!("{}.log", task_id.0.replace(['/', '\\'], "_")))
    }

    pub fn append(&self, task_id: &TaskId, lines: &[String]) -> io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(task_id))?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Last `n` lines; empty when nothing was captured.
    pub fn tail(&self, task_id: &TaskId, n: usize) -> io::Result<Vec<String>> {
        let content = match fs::read_to_string(self.path(task_id)) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|line| line.to_string()).collect())
    }

    /// Start a fresh log for a new attempt.
    pub fn truncate(&self, task_id: &TaskId) -> io::Result<()> {
        match fs::remove_file(self.path(task_id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_directory_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AgentLog::new(dir.path().join("logs"));
        let task = TaskId::new("T1");

        log.append(&task, &["first".to_string(), "second".to_string()])
            .expect("append");

        let content = fs::read_to_string(log.path(&task)).expect("read");
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AgentLog::new(dir.path());
        let task = TaskId::new("T1");
        let lines: Vec<String> = (1..=4).map(|i| format!("line{i}")).collect();
        log.append(&task, &lines).expect("append");

        assert_eq!(log.tail(&task, 2).expect("tail"), vec!["line3", "line4"]);
        assert_eq!(log.tail(&task, 10).expect("tail").len(), 4);
    }

    #[test]
    fn missing_log_tails_empty_and_truncate_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AgentLog::new(dir.path());
        let task = TaskId::new("missing");
        assert!(log.tail(&task, 5).expect("tail").is_empty());
        log.truncate(&task).expect("truncate missing");

        log.append(&task, &["x".to_string()]).expect("append");
        log.truncate(&task).expect("truncate");
        assert!(!log.path(&task).exists());
    }
}
