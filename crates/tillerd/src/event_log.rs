use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tiller_core::{Event, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle events as JSON lines: one global stream plus one file per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub task_dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let task_dir = root.join("tasks");
        Self {
            root,
            global_file,
            task_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        fs::create_dir_all(&self.task_dir).map_err(|source| EventLogError::CreateDir {
            path: self.task_dir.clone(),
            source,
        })
    }

    pub fn append_global(&self, event: &Event) -> Result<(), EventLogError> {
        append_json_line(&self.global_file, event)
    }

    pub fn append_task(&self, event: &Event) -> Result<(), EventLogError> {
        if let Some(task_id) = &event.task_id {
            append_json_line(&self.task_log_path(task_id), event)?;
        }
        Ok(())
    }

    pub fn append_both(&self, event: &Event) -> Result<(), EventLogError> {
        self.ensure_layout()?;
        self.append_global(event)?;
        self.append_task(event)
    }

    pub fn task_log_path(&self, task_id: &TaskId) -> PathBuf {
        self.task_dir
            .join(format!("{}.jsonl", task_id.0.replace(['/', '\\'], "_")))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }
}

fn append_json_line(path: &Path, event: &Event) -> Result<(), EventLogError> {
    let line =
        serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;

    writeln!(file, "{line}").map_err(|source| EventLogError::Append {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::EventKind;

    #[test]
    fn append_both_writes_global_and_task_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path().join("events"));
        let task = TaskId::new("T1");

        log.append_both(&Event::now(Some(&task), EventKind::AgentReset))
            .expect("task event");
        log.append_both(&Event::now(None, EventKind::GhostCleared))
            .expect("global event");

        let global = fs::read_to_string(log.global_log_path()).expect("global log");
        assert_eq!(global.lines().count(), 2);

        let task_lines = fs::read_to_string(log.task_log_path(&task)).expect("task log");
        let events: Vec<Event> = task_lines
            .lines()
            .map(|line| serde_json::from_str(line).expect("event json"))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::AgentReset);
    }

    #[test]
    fn global_events_create_no_task_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path());
        log.append_both(&Event::now(None, EventKind::GhostCleared))
            .expect("global event");
        assert!(fs::read_dir(&log.task_dir).expect("task dir").next().is_none());
    }

    #[test]
    fn task_ids_with_slashes_stay_inside_the_task_dir() {
        let log = JsonlEventLog::new("/haven/events");
        let path = log.task_log_path(&TaskId::new("prd/T1"));
        assert_eq!(path, PathBuf::from("/haven/events/tasks/prd_T1.jsonl"));
    }
}
