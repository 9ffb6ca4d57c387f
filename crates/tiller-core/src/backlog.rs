//! Backlog store collaborator.
//!
//! The engines only read task snapshots; status transitions requested by the
//! conductor go through [`BacklogStore::update_task_status`] so the store keeps
//! ownership of file-level atomicity.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::types::{Task, TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("task not found in backlog: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("failed to read backlog at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse backlog at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize backlog: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write backlog at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Timestamp changes that accompany a status transition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusFields {
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    /// Drop both timestamps before applying the ones above.
    pub clear_timestamps: bool,
}

impl StatusFields {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn done(at: DateTime<Utc>) -> Self {
        Self {
            done_at: Some(at),
            ..Self::default()
        }
    }

    pub fn cleared() -> Self {
        Self {
            clear_timestamps: true,
            ..Self::default()
        }
    }

    fn apply(&self, task: &mut Task) {
        if self.clear_timestamps {
            task.started_at = None;
            task.done_at = None;
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.done_at {
            task.done_at = Some(at);
        }
    }
}

pub trait BacklogStore: Send + Sync {
    fn list_tasks(&self) -> Result<Vec<Task>, BacklogError>;

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, BacklogError> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .find(|task| &task.id == task_id))
    }

    fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<Task, BacklogError>;
}

fn apply_update(
    tasks: &mut [Task],
    task_id: &TaskId,
    status: TaskStatus,
    fields: &StatusFields,
) -> Result<Task, BacklogError> {
    let task = tasks
        .iter_mut()
        .find(|task| &task.id == task_id)
        .ok_or_else(|| BacklogError::TaskNotFound {
            task_id: task_id.0.clone(),
        })?;
    task.status = status;
    fields.apply(task);
    Ok(task.clone())
}

/// In-process backlog, used by tests and embedders that own their task list.
#[derive(Debug, Default)]
pub struct MemoryBacklog {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryBacklog {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    pub fn upsert(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.iter_mut().find(|existing| existing.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }
}

impl BacklogStore for MemoryBacklog {
    fn list_tasks(&self) -> Result<Vec<Task>, BacklogError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<Task, BacklogError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        apply_update(&mut tasks, task_id, status, &fields)
    }
}

/// Backlog kept as a JSON array of tasks in a single file.
#[derive(Debug)]
pub struct JsonFileBacklog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Task>, BacklogError> {
        let body = fs::read_to_string(&self.path).map_err(|source| BacklogError::Read {
            path: self.path.clone(),
            source,
        })?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body).map_err(|source| BacklogError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, tasks: &[Task]) -> Result<(), BacklogError> {
        let body =
            serde_json::to_string_pretty(tasks).map_err(|source| BacklogError::Serialize { source })?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, body).map_err(|source| BacklogError::Write {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|source| BacklogError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl BacklogStore for JsonFileBacklog {
    fn list_tasks(&self) -> Result<Vec<Task>, BacklogError> {
        self.read()
    }

    fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<Task, BacklogError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.read()?;
        let updated = apply_update(&mut tasks, task_id, status, &fields)?;
        self.write(&tasks)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{name}-{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn memory_backlog_updates_status_and_timestamps() {
        let backlog = MemoryBacklog::new(vec![Task::new("T1", "first")]);
        let started = Utc::now();

        let task = backlog
            .update_task_status(
                &TaskId::new("T1"),
                TaskStatus::InProgress,
                StatusFields::started(started),
            )
            .expect("update");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.started_at, Some(started));

        let task = backlog
            .update_task_status(
                &TaskId::new("T1"),
                TaskStatus::NotStarted,
                StatusFields::cleared(),
            )
            .expect("reset");
        assert_eq!(task.started_at, None);
        assert_eq!(task.status, TaskStatus::NotStarted);
    }

    #[test]
    fn memory_backlog_reports_missing_task() {
        let backlog = MemoryBacklog::default();
        let err = backlog
            .update_task_status(&TaskId::new("T9"), TaskStatus::Done, StatusFields::default())
            .expect_err("missing task");
        assert!(matches!(err, BacklogError::TaskNotFound { task_id } if task_id == "T9"));
        assert!(backlog
            .get_task(&TaskId::new("T9"))
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn json_backlog_reads_aliases_and_persists_updates() {
        let path = unique_temp_path("tiller-backlog");
        fs::write(
            &path,
            r#"[
  {"id": "T1", "title": "one", "status": "Done"},
  {"id": "T2", "title": "two", "status": "todo", "blocked_by": ["T1"], "effort": "2h"}
]"#,
        )
        .expect("write fixture");

        let backlog = JsonFileBacklog::new(&path);
        let tasks = backlog.list_tasks().expect("list");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[1].status, TaskStatus::NotStarted);
        assert_eq!(tasks[1].blocked_by, vec![TaskId::new("T1")]);

        backlog
            .update_task_status(&TaskId::new("T2"), TaskStatus::InProgress, StatusFields::default())
            .expect("update");
        let reloaded = JsonFileBacklog::new(&path);
        let task = reloaded
            .get_task(&TaskId::new("T2"))
            .expect("lookup")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::InProgress);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn json_backlog_classifies_parse_errors() {
        let path = unique_temp_path("tiller-backlog-invalid");
        fs::write(&path, "{ not json").expect("write fixture");
        let err = JsonFileBacklog::new(&path)
            .list_tasks()
            .expect_err("invalid json");
        assert!(matches!(err, BacklogError::Parse { .. }));
        let _ = fs::remove_file(path);
    }
}
