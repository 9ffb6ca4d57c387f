pub mod backlog;
pub mod config;
pub mod effort;
pub mod events;
pub mod state;
pub mod types;
pub mod validation;

pub use backlog::*;
pub use config::*;
pub use effort::*;
pub use events::*;
pub use state::*;
pub use types::*;
pub use validation::*;

#[cfg(test)]
mod tests {
    use super::{parse_config, AgentStatus, TaskId, TaskStatus, Validate};
    use std::any::TypeId;

    #[test]
    fn crate_root_reexports_core_types() {
        let _ = TypeId::of::<TaskId>();
        let _ = TypeId::of::<TaskStatus>();
        let _ = TypeId::of::<AgentStatus>();
    }

    #[test]
    fn crate_root_reexports_parse_and_validate_helpers() {
        let mut config = parse_config(
            r#"
[agents]
command = "claude"
max_parallel = 2
"#,
        )
        .expect("parse config");

        assert!(config.validate().is_empty());

        config.agents.max_parallel = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.code == "agents.max_parallel.zero"));
    }
}
