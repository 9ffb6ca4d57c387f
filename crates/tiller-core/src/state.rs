//! Agent lifecycle states.

use serde::{Deserialize, Serialize};

/// Status of one agent execution attempt.
///
/// ```text
/// Spawned → Running → {Completed, Error, Killed} → Reaped
///    └──────────┴──────────────┴──────────────→ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Record written, process not (yet) confirmed running.
    Spawned,
    Running,
    Completed,
    Error,
    Killed,
    Rejected,
    Reaped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl AgentStatus {
    pub fn tag(self) -> &'static str {
        match self {
            AgentStatus::Spawned => "SPAWNED",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Completed => "COMPLETED",
            AgentStatus::Error => "ERROR",
            AgentStatus::Killed => "KILLED",
            AgentStatus::Rejected => "REJECTED",
            AgentStatus::Reaped => "REAPED",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "SPAWNED" => Some(AgentStatus::Spawned),
            "RUNNING" => Some(AgentStatus::Running),
            "COMPLETED" => Some(AgentStatus::Completed),
            "ERROR" => Some(AgentStatus::Error),
            "KILLED" => Some(AgentStatus::Killed),
            "REJECTED" => Some(AgentStatus::Rejected),
            "REAPED" => Some(AgentStatus::Reaped),
            _ => None,
        }
    }

    /// At most one live agent may exist per task.
    pub fn is_live(self) -> bool {
        matches!(self, AgentStatus::Spawned | AgentStatus::Running)
    }

    /// The process has stopped and its work is waiting to be reaped or rejected.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Error | AgentStatus::Killed
        )
    }

    /// Nothing further happens to the record except clearing it.
    pub fn is_closed(self) -> bool {
        matches!(self, AgentStatus::Reaped | AgentStatus::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Running).expect("serialize");
        assert_eq!(json, "\"RUNNING\"");
        let decoded: AgentStatus = serde_json::from_str("\"KILLED\"").expect("deserialize");
        assert_eq!(decoded, AgentStatus::Killed);
    }

    #[test]
    fn tags_roundtrip_through_from_tag() {
        for status in [
            AgentStatus::Spawned,
            AgentStatus::Running,
            AgentStatus::Completed,
            AgentStatus::Error,
            AgentStatus::Killed,
            AgentStatus::Rejected,
            AgentStatus::Reaped,
        ] {
            assert_eq!(AgentStatus::from_tag(status.tag()), Some(status));
        }
        assert_eq!(AgentStatus::from_tag("CLEARED"), None);
    }

    #[test]
    fn liveness_partitions_statuses() {
        assert!(AgentStatus::Spawned.is_live());
        assert!(AgentStatus::Running.is_live());
        assert!(!AgentStatus::Completed.is_live());
        assert!(AgentStatus::Killed.is_finished());
        assert!(AgentStatus::Reaped.is_closed());
        assert!(!AgentStatus::Running.is_closed());
    }
}
