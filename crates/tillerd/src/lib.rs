//! tiller: dependency-aware scheduling and isolated agent execution over a
//! git repository.

pub mod agent_log;
pub mod conductor;
pub mod dependency_graph;
pub mod error;
pub mod event_log;
pub mod locks;
pub mod logging;
pub mod persistence;
pub mod schedule;
pub mod state_machine;
pub mod types;

pub use agent_log::*;
pub use conductor::*;
pub use dependency_graph::*;
pub use error::*;
pub use event_log::*;
pub use persistence::*;
pub use schedule::*;
pub use state_machine::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::{is_transition_allowed, ConductorError, PreconditionFailure};
    use tiller_core::{AgentStatus, TaskId};

    #[test]
    fn crate_root_reexports_lifecycle_helpers() {
        assert!(is_transition_allowed(AgentStatus::Completed, AgentStatus::Reaped));
        let err = ConductorError::precondition(&TaskId::new("T1"), PreconditionFailure::AgentNotFound);
        assert!(err.is_precondition());
    }
}
