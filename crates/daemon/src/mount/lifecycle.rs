use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Mount lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    WaitingForDevice,
    Mounting,
    Running,
    Unmounting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::WaitingForDevice => "waiting_for_device",
            LifecycleState::Mounting => "mounting",
            LifecycleState::Running => "running",
            LifecycleState::Unmounting => "unmounting",
        }
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting_for_device" => LifecycleState::WaitingForDevice,
            "mounting" => LifecycleState::Mounting,
            "running" => LifecycleState::Running,
            "unmounting" => LifecycleState::Unmounting,
            other => return Err(UnknownState(other.to_string())),
        })
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown lifecycle state: {0}")]
pub struct UnknownState(pub String);

#[derive(Debug)]
struct Status {
    state: LifecycleState,
    /// Completed mount cycles (each return to `WaitingForDevice` from a mount)
    cycles: u64,
}

/// Shared, observable view of the controller's lifecycle state.
///
/// Only the controller writes. Observers can read or block until a given
/// state is reached.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<(Mutex<Status>, Condvar)>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(Status {
                    state: LifecycleState::WaitingForDevice,
                    cycles: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.0.lock().state
    }

    /// Number of mount cycles that have been torn down
    pub fn completed_cycles(&self) -> u64 {
        self.inner.0.lock().cycles
    }

    pub(crate) fn set(&self, state: LifecycleState) {
        let (lock, cvar) = &*self.inner;
        let mut status = lock.lock();
        if status.state == LifecycleState::Unmounting && state == LifecycleState::WaitingForDevice
        {
            status.cycles += 1;
        }
        if status.state != state {
            tracing::debug!(from = %status.state, to = %state, "Lifecycle transition");
        }
        status.state = state;
        cvar.notify_all();
    }

    /// Block until the state equals `state` or `timeout` elapses.
    ///
    /// Returns whether the state was reached.
    pub fn wait_for(&self, state: LifecycleState, timeout: Duration) -> bool {
        self.wait_until(timeout, |status| status.state == state)
    }

    /// Block until at least `cycles` mount cycles have completed.
    pub fn wait_for_cycles(&self, cycles: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |status| status.cycles >= cycles)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&Status) -> bool) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut status = lock.lock();
        while !done(&status) {
            if cvar.wait_until(&mut status, deadline).timed_out() {
                return done(&status);
            }
        }
        true
    }
}
