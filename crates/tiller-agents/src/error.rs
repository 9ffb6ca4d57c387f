#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid agent command: {message}")]
    InvalidCommand { message: String },
    #[error("agent executable not found in PATH: {executable}")]
    ExecutableNotFound { executable: String },
    #[error("agent spawn failed ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[error("agent runtime error: {message}")]
    Runtime { message: String },
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::AgentError;

    #[test]
    fn invalid_command_error_formats_message() {
        let err = AgentError::InvalidCommand {
            message: "executable is empty".to_string(),
        };
        assert_eq!(err.to_string(), "invalid agent command: executable is empty");
    }

    #[test]
    fn spawn_error_keeps_io_source() {
        let err = AgentError::Spawn {
            command: "claude -p hi".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().starts_with("agent spawn failed (claude -p hi)"));
        assert!(err.source().is_some());
    }

    #[test]
    fn signal_error_names_pid() {
        let err = AgentError::Signal {
            pid: 42,
            message: "EPERM".to_string(),
        };
        assert_eq!(err.to_string(), "failed to signal pid 42: EPERM");
    }
}
