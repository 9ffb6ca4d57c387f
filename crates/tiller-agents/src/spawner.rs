//! Process spawner collaborator: the only place agent processes are launched.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

use crate::error::AgentError;
#[cfg(unix)]
use crate::process::{kill_pid, terminate_pid};
use crate::types::{AgentCommand, ExitInfo};

/// A launched agent process.
pub trait AgentProcess: Send {
    fn pid(&self) -> u32;
    /// Merged stdout/stderr lines. Yields `Some` once; the receiver
    /// disconnects after both streams close.
    fn take_output(&mut self) -> Option<mpsc::Receiver<String>>;
    fn try_wait(&mut self) -> Result<Option<ExitInfo>, AgentError>;
    fn wait(&mut self) -> Result<ExitInfo, AgentError>;
    /// Polite stop request (SIGTERM on unix).
    fn terminate(&mut self) -> Result<(), AgentError>;
    /// Forced stop (SIGKILL on unix).
    fn kill(&mut self) -> Result<(), AgentError>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &AgentCommand) -> Result<Box<dyn AgentProcess>, AgentError>;
}

/// Spawns real OS processes with piped output and a null stdin.
#[derive(Debug, Clone, Default)]
pub struct SystemSpawner {
    /// Environment variables removed from the inherited environment.
    pub env_remove: Vec<String>,
}

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, command: &AgentCommand) -> Result<Box<dyn AgentProcess>, AgentError> {
        if command.executable.trim().is_empty() {
            return Err(AgentError::InvalidCommand {
                message: "executable is empty".to_string(),
            });
        }

        let mut builder = Command::new(&command.executable);
        builder
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for key in &self.env_remove {
            builder.env_remove(key);
        }
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut builder, 0);

        let mut child = builder.spawn().map_err(|source| AgentError::Spawn {
            command: command.render(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        pipe_child_output(&mut child, tx);
        tracing::debug!(pid = child.id(), cwd = %command.cwd.display(), "spawned agent process");

        Ok(Box::new(SystemProcess {
            child,
            output: Some(rx),
        }))
    }
}

struct SystemProcess {
    child: Child,
    output: Option<mpsc::Receiver<String>>,
}

impl AgentProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>, AgentError> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitInfo::from))
            .map_err(|err| AgentError::Runtime {
                message: err.to_string(),
            })
    }

    fn wait(&mut self) -> Result<ExitInfo, AgentError> {
        self.child
            .wait()
            .map(ExitInfo::from)
            .map_err(|err| AgentError::Runtime {
                message: err.to_string(),
            })
    }

    fn terminate(&mut self) -> Result<(), AgentError> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            terminate_pid(self.child.id()).map(|_| ())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> Result<(), AgentError> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            kill_pid(self.child.id()).map(|_| ())
        }
        #[cfg(not(unix))]
        {
            self.child.kill().map_err(|err| AgentError::Runtime {
                message: err.to_string(),
            })
        }
    }
}

/// Spawn background threads that pipe stdout and stderr lines into `tx`.
///
/// Consumes `tx` (the last clone goes to the stderr thread).
fn pipe_child_output(child: &mut Child, tx: mpsc::Sender<String>) {
    if let Some(stdout) = child.stdout.take() {
        let tx_out = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                let _ = tx_out.send(line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                let _ = tx.send(line);
            }
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("TILLER_TEST_VALUE".to_string(), "from-env".to_string())],
            cwd: std::env::temp_dir(),
        }
    }

    #[test]
    fn captures_stdout_and_stderr_lines_and_exit_code() {
        let mut process = SystemSpawner::default()
            .spawn(&sh("echo out; echo err 1>&2; echo $TILLER_TEST_VALUE; exit 3"))
            .expect("spawn");
        let rx = process.take_output().expect("output receiver");
        assert!(process.take_output().is_none());

        let exit = process.wait().expect("wait");
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());

        let mut lines: Vec<String> = rx.iter().collect();
        lines.sort();
        assert_eq!(lines, vec!["err", "from-env", "out"]);
    }

    #[test]
    fn terminate_reports_signal_exit() {
        let mut process = SystemSpawner::default()
            .spawn(&sh("sleep 30"))
            .expect("spawn");
        assert!(process.try_wait().expect("poll").is_none());

        process.terminate().expect("terminate");
        let exit = process.wait().expect("wait");
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));

        // Stopping an exited process is a no-op.
        process.terminate().expect("idempotent terminate");
        process.kill().expect("idempotent kill");
    }

    #[test]
    fn spawn_failure_names_the_command() {
        let command = AgentCommand {
            executable: "/definitely/missing/agent".to_string(),
            args: vec!["--flag".to_string()],
            env: Vec::new(),
            cwd: PathBuf::from("/"),
        };
        let err = SystemSpawner::default()
            .spawn(&command)
            .err()
            .expect("missing binary fails");
        assert!(matches!(err, AgentError::Spawn { command, .. } if command == "/definitely/missing/agent --flag"));
    }

    #[test]
    fn empty_executable_is_rejected_before_spawning() {
        let mut command = sh("true");
        command.executable = "  ".to_string();
        let err = SystemSpawner::default()
            .spawn(&command)
            .err()
            .expect("empty executable");
        assert!(matches!(err, AgentError::InvalidCommand { .. }));
    }
}
