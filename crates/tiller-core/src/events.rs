use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::AgentStatus;
use crate::types::{EventId, MergeStrategy, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogKind {
    IdleTimeout,
    WallTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentSpawned {
        pid: u32,
        branch: Option<String>,
        worktree: Option<String>,
    },
    AgentQueued {
        position: usize,
    },
    SpawnFailed {
        message: String,
    },
    AgentExited {
        status: AgentStatus,
        exit_code: Option<i32>,
    },
    WatchdogFired {
        kind: WatchdogKind,
        after_secs: u64,
    },
    AgentKilled {
        reason: String,
    },
    StatusReconciled {
        from: AgentStatus,
        to: AgentStatus,
        reason: String,
    },
    AutoCommitted {
        sha: String,
    },
    MergeCompleted {
        source: String,
        target: String,
        strategy: MergeStrategy,
        head: String,
    },
    MergeConflict {
        source: String,
        target: String,
        files: Vec<String>,
    },
    AgentReaped {
        merged_into: Vec<String>,
    },
    AgentRejected {
        reason: String,
    },
    AgentReset,
    WorktreePruned {
        path: String,
    },
    GhostCleared,
}

impl EventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::AgentSpawned { .. } => "agent_spawned",
            EventKind::AgentQueued { .. } => "agent_queued",
            EventKind::SpawnFailed { .. } => "spawn_failed",
            EventKind::AgentExited { .. } => "agent_exited",
            EventKind::WatchdogFired { .. } => "watchdog_fired",
            EventKind::AgentKilled { .. } => "agent_killed",
            EventKind::StatusReconciled { .. } => "status_reconciled",
            EventKind::AutoCommitted { .. } => "auto_committed",
            EventKind::MergeCompleted { .. } => "merge_completed",
            EventKind::MergeConflict { .. } => "merge_conflict",
            EventKind::AgentReaped { .. } => "agent_reaped",
            EventKind::AgentRejected { .. } => "agent_rejected",
            EventKind::AgentReset => "agent_reset",
            EventKind::WorktreePruned { .. } => "worktree_pruned",
            EventKind::GhostCleared => "ghost_cleared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub task_id: Option<TaskId>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    /// Build an event whose id is derived from task, kind and timestamp.
    pub fn now(task_id: Option<&TaskId>, kind: EventKind) -> Self {
        let at = Utc::now();
        let scope = task_id.map(|id| id.0.as_str()).unwrap_or("global");
        let id = EventId(format!(
            "{scope}-{}-{}",
            kind.tag(),
            at.timestamp_nanos_opt().unwrap_or_default()
        ));
        Self {
            id,
            task_id: task_id.cloned(),
            at,
            kind,
        }
    }
}
