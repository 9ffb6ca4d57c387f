use std::fmt;
use std::path::PathBuf;

use tiller_agents::AgentError;
use tiller_core::{AgentStatus, BacklogError, BranchTier, TaskId};
use tiller_git::GitError;

use crate::dependency_graph::{format_path, GraphError};
use crate::event_log::EventLogError;
use crate::persistence::PersistenceError;
use crate::state_machine::StateMachineError;

/// A condition that must hold before an operation touches any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionFailure {
    TaskNotFound,
    AgentNotFound,
    AlreadyRunning { status: AgentStatus, pid: Option<u32> },
    UnreapedAgent { status: AgentStatus },
    AgentFailed { status: AgentStatus },
    AgentRejected,
    AlreadyReaped,
    StillRunning { waited_secs: Option<u64> },
    BlockedBy { blockers: Vec<TaskId> },
    AtCapacity { running: usize, max_parallel: usize },
    MissingDependency { executable: String },
    DirtyRepository { files: Vec<String> },
    DirtyWorktree { path: PathBuf, files: Vec<String> },
    MissingWorktree { path: PathBuf },
    MissingBranch { branch: String },
    UnsupportedTier { tier: BranchTier },
    EmptyTier { tier: BranchTier, id: String },
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound => f.write_str("task is not in the backlog"),
            Self::AgentNotFound => f.write_str("no agent record exists"),
            Self::AlreadyRunning { status, pid } => match pid {
                Some(pid) => write!(f, "agent already {status} (pid {pid})"),
                None => write!(f, "agent already {status}"),
            },
            Self::UnreapedAgent { status } => {
                write!(f, "previous agent is {status} and has not been reaped")
            }
            Self::AgentFailed { status } => write!(f, "agent finished as {status}"),
            Self::AgentRejected => f.write_str("agent was rejected"),
            Self::AlreadyReaped => f.write_str("agent work was already merged"),
            Self::StillRunning { waited_secs } => match waited_secs {
                Some(secs) => write!(f, "agent still running after {secs}s"),
                None => f.write_str("agent still running"),
            },
            Self::BlockedBy { blockers } => {
                write!(f, "unresolved blockers: {}", join_ids(blockers))
            }
            Self::AtCapacity {
                running,
                max_parallel,
            } => write!(f, "{running} agents running (max_parallel = {max_parallel})"),
            Self::MissingDependency { executable } => {
                write!(f, "agent command `{executable}` not found in PATH")
            }
            Self::DirtyRepository { files } => {
                write!(f, "repository has uncommitted changes: {}", files.join(", "))
            }
            Self::DirtyWorktree { path, files } => write!(
                f,
                "worktree {} has uncommitted changes: {}",
                path.display(),
                files.join(", ")
            ),
            Self::MissingWorktree { path } => {
                write!(f, "worktree {} does not exist", path.display())
            }
            Self::MissingBranch { branch } => write!(f, "branch {branch} does not exist"),
            Self::UnsupportedTier { tier } => {
                write!(f, "tier {tier} cannot be merged manually")
            }
            Self::EmptyTier { tier, id } => write!(f, "no backlog tasks belong to {tier} {id}"),
        }
    }
}

impl PreconditionFailure {
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::TaskNotFound => "check the task id against the backlog",
            Self::AgentNotFound => "spawn an agent for the task first",
            Self::AlreadyRunning { .. } => "wait for the agent, or kill it",
            Self::UnreapedAgent { .. } => "reap, reject or reset the previous agent",
            Self::AgentFailed { .. } => "inspect the log, then reject or reset the agent",
            Self::AgentRejected => "reset the task to start over",
            Self::AlreadyReaped => "reset the task to clear the record",
            Self::StillRunning { .. } => "wait longer, or kill the agent",
            Self::BlockedBy { .. } => "finish the blocking tasks first",
            Self::AtCapacity { .. } => "wait for a running agent to finish, or spawn with queueing",
            Self::MissingDependency { .. } => "install the agent CLI or fix agents.command",
            Self::DirtyRepository { .. } => "commit or stash changes in the repository",
            Self::DirtyWorktree { .. } => "commit in the worktree, enable merge.auto_commit, or reject",
            Self::MissingWorktree { .. } => "run prune, then reject or reset the agent",
            Self::MissingBranch { .. } => "create the branch or respawn with a worktree",
            Self::UnsupportedTier { .. } => "merge epic or prd tiers; tasks merge on reap",
            Self::EmptyTier { .. } => "check the epic or prd id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceConflict {
    /// A worktree or branch for the task exists with no agent tracking it.
    OrphanedWorktree {
        path: PathBuf,
        branch: String,
        worktree_exists: bool,
    },
}

impl fmt::Display for ResourceConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedWorktree {
                path,
                branch,
                worktree_exists: true,
            } => write!(
                f,
                "orphaned worktree {} on branch {branch}",
                path.display()
            ),
            Self::OrphanedWorktree { branch, .. } => {
                write!(f, "branch {branch} exists without a tracked agent")
            }
        }
    }
}

impl ResourceConflict {
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::OrphanedWorktree { .. } => "spawn with resume to continue, or reset to discard",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("preconditions not met for {task_id}: {}", join_failures(failures))]
    Precondition {
        task_id: TaskId,
        failures: Vec<PreconditionFailure>,
    },
    #[error("resource conflict for {task_id}: {conflict}")]
    ResourceConflict {
        task_id: TaskId,
        conflict: ResourceConflict,
    },
    #[error("agent for {task_id} failed: {reason}")]
    Process {
        task_id: TaskId,
        reason: String,
        output_tail: Vec<String>,
    },
    #[error("merging {source_branch} into {target_branch} conflicts in: {}", files.join(", "))]
    MergeConflict {
        source_branch: String,
        target_branch: String,
        files: Vec<String>,
    },
    #[error("dependency cycle: {}", format_path(path))]
    Cycle { path: Vec<TaskId> },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Backlog(#[from] BacklogError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConductorError {
    pub fn precondition(task_id: &TaskId, failure: PreconditionFailure) -> Self {
        Self::Precondition {
            task_id: task_id.clone(),
            failures: vec![failure],
        }
    }

    /// Next operator action, when one is known.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Precondition { failures, .. } => Some(
                failures
                    .iter()
                    .map(PreconditionFailure::suggestion)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            Self::ResourceConflict { conflict, .. } => Some(conflict.suggestion().to_string()),
            Self::Process { .. } => Some("inspect the agent log, then reject or reset".to_string()),
            Self::MergeConflict { source_branch, .. } => Some(format!(
                "resolve the conflicts on {source_branch} by hand and reap again, or reject"
            )),
            Self::Cycle { .. } => Some("remove one blocked_by edge on the cycle".to_string()),
            _ => None,
        }
    }

    /// Safe to retry unchanged once the reported condition is fixed.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_failures(failures: &[PreconditionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_message_names_blockers() {
        let err = ConductorError::precondition(
            &TaskId::new("T2"),
            PreconditionFailure::BlockedBy {
                blockers: vec![TaskId::new("T1")],
            },
        );
        assert_eq!(
            err.to_string(),
            "preconditions not met for T2: unresolved blockers: T1"
        );
        assert_eq!(
            err.suggestion().as_deref(),
            Some("finish the blocking tasks first")
        );
        assert!(err.is_precondition());
    }

    #[test]
    fn multiple_failures_are_joined() {
        let err = ConductorError::Precondition {
            task_id: TaskId::new("T1"),
            failures: vec![
                PreconditionFailure::AlreadyRunning {
                    status: AgentStatus::Running,
                    pid: Some(12),
                },
                PreconditionFailure::AtCapacity {
                    running: 3,
                    max_parallel: 3,
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("agent already RUNNING (pid 12)"));
        assert!(message.contains("3 agents running (max_parallel = 3)"));
    }

    #[test]
    fn cycle_and_conflict_messages_carry_details() {
        let cycle = ConductorError::Cycle {
            path: vec![TaskId::new("A"), TaskId::new("B"), TaskId::new("A")],
        };
        assert_eq!(cycle.to_string(), "dependency cycle: A -> B -> A");

        let conflict = ConductorError::MergeConflict {
            source_branch: "task/T1".to_string(),
            target_branch: "epic/E1".to_string(),
            files: vec!["src/lib.rs".to_string()],
        };
        assert!(conflict.to_string().contains("src/lib.rs"));
        assert!(conflict.suggestion().is_some_and(|s| s.contains("task/T1")));
    }

    #[test]
    fn orphan_conflict_suggests_resume_or_reset() {
        let err = ConductorError::ResourceConflict {
            task_id: TaskId::new("T1"),
            conflict: ResourceConflict::OrphanedWorktree {
                path: PathBuf::from("/h/worktrees/task/T1"),
                branch: "task/T1".to_string(),
                worktree_exists: true,
            },
        };
        assert!(err.to_string().contains("orphaned worktree"));
        assert!(err.suggestion().is_some_and(|s| s.contains("resume")));
    }
}
