use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiller_core::{AgentStatus, TaskId};
use tiller_git::MergeOutcome;

/// One agent execution attempt, keyed by task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub task_id: TaskId,
    pub status: AgentStatus,
    pub pid: Option<u32>,
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reaped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Why the agent was killed, rejected or marked as failed.
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn spawned(task_id: TaskId, worktree: Option<PathBuf>, branch: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: AgentStatus::Spawned,
            pid: None,
            worktree,
            branch,
            started_at: now,
            completed_at: None,
            reaped_at: None,
            exit_code: None,
            reason: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Wall-clock cap in seconds; the configured timeout when unset.
    pub timeout_secs: Option<u64>,
    /// Reattach an existing worktree/branch left behind for this task.
    pub resume: bool,
    /// Run in an isolated worktree instead of the repository root.
    pub worktree: bool,
    /// Queue instead of failing when at capacity; the configured policy when unset.
    pub queue: Option<bool>,
}

impl SpawnOptions {
    pub fn isolated() -> Self {
        Self {
            worktree: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Started(AgentRecord),
    Queued { position: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOptions {
    pub wait: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapOutcome {
    pub task_id: TaskId,
    pub already_reaped: bool,
    pub merges: Vec<MergeOutcome>,
    /// A higher tier that could not be merged; the task itself is reaped.
    pub escalation: Option<MergeOutcome>,
    pub worktree_removed: bool,
}

/// Point-in-time view of an agent after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentView {
    pub record: AgentRecord,
    pub process_alive: bool,
    /// Supervised by a watchdog thread in this process.
    pub supervised: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Haven worktrees with no agent record that owns them.
    pub orphaned_worktrees: Vec<OrphanedWorktree>,
    /// Open records whose worktree directory is gone and whose process is dead.
    pub ghost_agents: Vec<TaskId>,
    /// Git worktree metadata pointing at missing directories.
    pub stale_metadata: Vec<PathBuf>,
    pub applied: bool,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_worktrees.is_empty()
            && self.ghost_agents.is_empty()
            && self.stale_metadata.is_empty()
    }

    /// Orphans holding work that `apply` leaves in place.
    pub fn retained(&self) -> impl Iterator<Item = &OrphanedWorktree> {
        self.orphaned_worktrees
            .iter()
            .filter(|orphan| !orphan.is_disposable())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    /// Uncommitted paths in the worktree, untracked files included.
    pub dirty_files: Vec<String>,
    /// Branch the work would merge into next.
    pub merge_target: Option<String>,
    /// Commits on the branch that `merge_target` does not have.
    pub unmerged_commits: usize,
}

impl OrphanedWorktree {
    /// Nothing would be lost by deleting it. Anything else needs `reject` or `resume`.
    pub fn is_disposable(&self) -> bool {
        self.dirty_files.is_empty() && self.unmerged_commits == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub spawned: Vec<TaskId>,
    pub reaped: Vec<TaskId>,
    /// Agents that finished without success and were left for inspection.
    pub failed: Vec<TaskId>,
    /// Spawns or reaps refused by a precondition, with the reason.
    pub skipped: Vec<(TaskId, String)>,
    pub interrupted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_record_roundtrip_preserves_optional_fields() {
        let mut record = AgentRecord::spawned(
            TaskId::new("T1"),
            Some(PathBuf::from("/haven/worktrees/task/T1")),
            Some("task/T1".to_string()),
        );
        record.pid = Some(4242);
        record.exit_code = Some(0);

        let encoded = serde_json::to_string(&record).expect("serialize");
        let decoded: AgentRecord = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, record);
        assert!(encoded.contains("\"SPAWNED\""));
    }

    #[test]
    fn isolated_spawn_options_request_a_worktree() {
        let options = SpawnOptions::isolated();
        assert!(options.worktree);
        assert!(!options.resume);
        assert_eq!(options.queue, None);
    }

    #[test]
    fn empty_prune_report_is_clean() {
        let mut report = PruneReport::default();
        assert!(report.is_clean());
        report.ghost_agents.push(TaskId::new("T1"));
        assert!(!report.is_clean());
    }

    #[test]
    fn only_clean_merged_orphans_are_disposable() {
        let orphan = |dirty: &[&str], unmerged| OrphanedWorktree {
            path: PathBuf::from("/haven/worktrees/task/T1"),
            branch: Some("task/T1".to_string()),
            dirty_files: dirty.iter().map(|file| file.to_string()).collect(),
            merge_target: Some("main".to_string()),
            unmerged_commits: unmerged,
        };
        let report = PruneReport {
            orphaned_worktrees: vec![orphan(&[], 0), orphan(&["notes.txt"], 0), orphan(&[], 2)],
            ..PruneReport::default()
        };
        assert!(report.orphaned_worktrees[0].is_disposable());
        assert_eq!(report.retained().count(), 2);
    }
}
