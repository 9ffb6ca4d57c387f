//! Backlog data model shared by every tiller crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" | "medium" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" | "urgent" => Ok(TaskPriority::Critical),
            other => Err(format!(
                "invalid task priority '{other}'. valid values: low, normal, high, critical"
            )),
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a backlog task.
///
/// Serialized in snake_case. Deserialization goes through [`TaskStatus::from_str`]
/// so that the aliases found in hand-written backlogs are resolved once, at the
/// boundary; nothing past the adapters compares raw status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Blocked,
    Done,
    Cancelled,
    AutoDone,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::AutoDone => "auto_done",
        }
    }

    /// Done, Cancelled and AutoDone release their dependents.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::AutoDone
        )
    }

    /// Work has begun (or finished) on the task, so its `started_at` is meaningful.
    pub fn has_started(self) -> bool {
        matches!(
            self,
            TaskStatus::InProgress | TaskStatus::Done | TaskStatus::AutoDone
        )
    }

    pub fn is_done(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::AutoDone)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value
            .trim()
            .to_lowercase()
            .replace(['-', ' '], "_");
        match normalized.as_str() {
            "not_started" | "notstarted" | "todo" | "to_do" | "pending" | "open" | "new" => {
                Ok(TaskStatus::NotStarted)
            }
            "in_progress" | "inprogress" | "wip" | "doing" | "started" | "active" => {
                Ok(TaskStatus::InProgress)
            }
            "blocked" | "on_hold" => Ok(TaskStatus::Blocked),
            "done" | "complete" | "completed" | "closed" | "finished" => Ok(TaskStatus::Done),
            "cancelled" | "canceled" | "wontfix" | "won't_fix" | "dropped" => {
                Ok(TaskStatus::Cancelled)
            }
            "auto_done" | "autodone" => Ok(TaskStatus::AutoDone),
            _ => Err(format!(
                "invalid task status '{}'. valid values: not_started, in_progress, blocked, done, cancelled, auto_done",
                value.trim()
            )),
        }
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a task inside the PRD → Epic → Task hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParentRef {
    #[serde(default)]
    pub prd: Option<String>,
    #[serde(default)]
    pub epic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Duration string ("2h", "30m") or legacy size token ("M").
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub parent: ParentRef,
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.into(),
            status: TaskStatus::NotStarted,
            assignee: None,
            effort: None,
            priority: TaskPriority::Normal,
            parent: ParentRef::default(),
            blocked_by: Vec::new(),
            started_at: None,
            done_at: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_effort(mut self, effort: impl Into<String>) -> Self {
        self.effort = Some(effort.into());
        self
    }

    pub fn with_blockers<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = blockers.into_iter().map(TaskId::new).collect();
        self
    }

    pub fn with_parent(mut self, prd: Option<&str>, epic: Option<&str>) -> Self {
        self.parent = ParentRef {
            prd: prd.map(str::to_string),
            epic: epic.map(str::to_string),
        };
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_done_at(mut self, at: DateTime<Utc>) -> Self {
        self.done_at = Some(at);
        self
    }
}

/// Branch tiers of the merge cascade, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BranchTier {
    Task,
    Epic,
    Prd,
    Main,
}

impl BranchTier {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchTier::Task => "task",
            BranchTier::Epic => "epic",
            BranchTier::Prd => "prd",
            BranchTier::Main => "main",
        }
    }
}

impl std::str::FromStr for BranchTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "task" => Ok(BranchTier::Task),
            "epic" => Ok(BranchTier::Epic),
            "prd" => Ok(BranchTier::Prd),
            "main" => Ok(BranchTier::Main),
            other => Err(format!(
                "invalid branch tier '{other}'. valid values: task, epic, prd, main"
            )),
        }
    }
}

impl std::fmt::Display for BranchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    #[default]
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "squash" => Ok(MergeStrategy::Squash),
            "merge" => Ok(MergeStrategy::Merge),
            "rebase" => Ok(MergeStrategy::Rebase),
            other => Err(format!(
                "invalid merge strategy '{other}'. valid values: squash, merge, rebase"
            )),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source tier whose merge into its parent collapses history into one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SquashLevel {
    Task,
    Epic,
    #[default]
    Prd,
    Off,
}

impl SquashLevel {
    pub fn squashes(self, source: BranchTier) -> bool {
        matches!(
            (self, source),
            (SquashLevel::Task, BranchTier::Task)
                | (SquashLevel::Epic, BranchTier::Epic)
                | (SquashLevel::Prd, BranchTier::Prd)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_resolves_aliases_case_insensitively() {
        assert_eq!("TODO".parse::<TaskStatus>(), Ok(TaskStatus::NotStarted));
        assert_eq!("In Progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("wip".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("Completed".parse::<TaskStatus>(), Ok(TaskStatus::Done));
        assert_eq!("canceled".parse::<TaskStatus>(), Ok(TaskStatus::Cancelled));
        assert_eq!("auto-done".parse::<TaskStatus>(), Ok(TaskStatus::AutoDone));
        assert!("someday".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_deserializes_through_alias_resolution() {
        let status: TaskStatus = serde_json::from_str("\"Not Started\"").expect("alias");
        assert_eq!(status, TaskStatus::NotStarted);

        let encoded = serde_json::to_string(&TaskStatus::AutoDone).expect("serialize");
        assert_eq!(encoded, "\"auto_done\"");
    }

    #[test]
    fn terminal_statuses_release_dependents() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::AutoDone.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn task_defaults_fill_missing_fields() {
        let task: Task =
            serde_json::from_str(r#"{"id":"T1","title":"Write parser"}"#).expect("parse task");
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(task.blocked_by.is_empty());
        assert_eq!(task.parent, ParentRef::default());
    }

    #[test]
    fn squash_level_matches_only_its_source_tier() {
        assert!(SquashLevel::Prd.squashes(BranchTier::Prd));
        assert!(!SquashLevel::Prd.squashes(BranchTier::Task));
        assert!(!SquashLevel::Off.squashes(BranchTier::Epic));
    }

    #[test]
    fn merge_strategy_parses_known_values() {
        assert_eq!("SQUASH".parse::<MergeStrategy>(), Ok(MergeStrategy::Squash));
        assert!("octopus".parse::<MergeStrategy>().is_err());
    }
}
