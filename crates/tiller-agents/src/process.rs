//! Pid-level liveness checks and termination signals.
//!
//! These work on bare pids so that a record written by one tiller process can
//! be inspected or killed from another.

use crate::error::AgentError;

fn valid_pid(pid: u32) -> Option<i32> {
    // 0 and negative values address process groups, never a single agent.
    i32::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// True when a process with this pid exists (a zombie still counts).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(raw) = valid_pid(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    // No portable probe; assume alive so nothing is reconciled away by mistake.
    valid_pid(pid).is_some()
}

/// Ask the process to stop. Returns `false` when it was already gone.
pub fn terminate_pid(pid: u32) -> Result<bool, AgentError> {
    send(pid, Stop::Terminate)
}

/// Stop the process unconditionally. Returns `false` when it was already gone.
pub fn kill_pid(pid: u32) -> Result<bool, AgentError> {
    send(pid, Stop::Kill)
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Terminate,
    Kill,
}

/// Agents are spawned as process-group leaders, so the whole group is
/// signalled first; plain pids fall back to a single-process signal.
#[cfg(unix)]
fn send(pid: u32, stop: Stop) -> Result<bool, AgentError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = valid_pid(pid) else {
        return Ok(false);
    };
    let signal = match stop {
        Stop::Terminate => Signal::SIGTERM,
        Stop::Kill => Signal::SIGKILL,
    };
    let target = Pid::from_raw(raw);
    let result = match killpg(target, signal) {
        Err(Errno::ESRCH) => kill(target, signal),
        other => other,
    };
    match result {
        Ok(()) => {
            tracing::debug!(pid, ?signal, "signalled agent process");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(AgentError::Signal {
            pid,
            message: errno.desc().to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send(pid: u32, _stop: Stop) -> Result<bool, AgentError> {
    Err(AgentError::Signal {
        pid,
        message: "signals are only supported on unix".to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn own_pid_is_alive_and_group_pids_are_not() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
    }

    #[test]
    fn terminate_stops_a_sleeping_child() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();
        assert!(pid_alive(pid));

        assert!(terminate_pid(pid).expect("send SIGTERM"));
        let status = child.wait().expect("wait");
        assert!(!status.success());

        let deadline = Instant::now() + Duration::from_secs(2);
        while pid_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!pid_alive(pid));
        assert!(!terminate_pid(pid).expect("already gone"));
        assert!(!kill_pid(pid).expect("already gone"));
    }
}
