//! Idle-output watchdog and wall-clock cap for one agent run.

use std::time::{Duration, Instant};

use tiller_core::WatchdogKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    Expired { kind: WatchdogKind, after: Duration },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    started: Instant,
    last_output: Instant,
    idle: Duration,
    wall: Duration,
}

impl Watchdog {
    pub fn new(idle: Duration, wall: Duration) -> Self {
        Self::starting_at(Instant::now(), idle, wall)
    }

    pub fn starting_at(now: Instant, idle: Duration, wall: Duration) -> Self {
        Self {
            started: now,
            last_output: now,
            idle,
            wall,
        }
    }

    pub fn observe_output(&mut self, now: Instant) {
        self.last_output = now;
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// The wall-clock cap wins when both limits have passed.
    pub fn check(&self, now: Instant) -> WatchdogVerdict {
        let elapsed = self.elapsed(now);
        if elapsed >= self.wall {
            return WatchdogVerdict::Expired {
                kind: WatchdogKind::WallTimeout,
                after: elapsed,
            };
        }
        let silent = now.saturating_duration_since(self.last_output);
        if silent >= self.idle {
            return WatchdogVerdict::Expired {
                kind: WatchdogKind::IdleTimeout,
                after: silent,
            };
        }
        WatchdogVerdict::Healthy
    }
}

/// Tracks a polite stop request so it can be escalated to a forced kill.
#[derive(Debug, Clone, Copy)]
pub struct KillEscalation {
    requested_at: Instant,
    grace: Duration,
    forced: bool,
}

impl KillEscalation {
    pub fn new(requested_at: Instant, grace: Duration) -> Self {
        Self {
            requested_at,
            grace,
            forced: false,
        }
    }

    /// True exactly once, the first time the grace period has run out.
    pub fn should_force(&mut self, now: Instant) -> bool {
        if self.forced || now.saturating_duration_since(self.requested_at) < self.grace {
            return false;
        }
        self.forced = true;
        true
    }
}
