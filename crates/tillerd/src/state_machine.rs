//! Agent lifecycle transitions.

use chrono::{DateTime, Utc};
use tiller_core::AgentStatus;

use crate::types::AgentRecord;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid agent state transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

/// Move a record to `to`, stamping the lifecycle timestamps that go with it.
pub fn transition_agent(
    record: &mut AgentRecord,
    to: AgentStatus,
    at: DateTime<Utc>,
) -> Result<StateTransition, StateMachineError> {
    let from = record.status;
    if !is_transition_allowed(from, to) {
        return Err(StateMachineError::InvalidTransition { from, to });
    }

    record.status = to;
    record.updated_at = at;
    if to.is_finished() && record.completed_at.is_none() {
        record.completed_at = Some(at);
    }
    if to == AgentStatus::Reaped {
        record.reaped_at = Some(at);
    }

    Ok(StateTransition { from, to, at })
}

/// ```text
/// Spawned → Running → {Completed, Error, Killed}
///    └──────────────→ {Error, Killed}
/// Completed → Reaped
/// anything not yet Reaped → Rejected
/// ```
pub fn is_transition_allowed(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Spawned, Running) => true,
        // Launch failed, or the process was stopped before it was confirmed.
        (Spawned, Error) | (Spawned, Killed) => true,
        (Running, Completed) | (Running, Error) | (Running, Killed) => true,
        // Only successful work is merged.
        (Completed, Reaped) => true,
        (Reaped, Rejected) => false,
        (_, Rejected) => true,
        _ => false,
    }
}
