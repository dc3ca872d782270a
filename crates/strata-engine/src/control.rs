//! Cooperative stop and hard abort for running operations.
//!
//! A [`TaskControl`] is a cheap cloneable handle onto one signal. The
//! signal only moves forward (running, stop requested, abort requested)
//! until the next operation starts and resets it. The running operation
//! polls it at unit boundaries; nothing is ever preempted.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const RUNNING: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const ABORT_REQUESTED: u8 = 2;

/// Lifecycle of the current (or last) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Running,
    /// A stop was requested; the current unit is being finished.
    StoppingGracefully,
    /// Stopped early after a consistent partial commit.
    Stopped,
    Completed,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StoppingGracefully => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    signal: AtomicU8,
    state: Mutex<OperationState>,
}

/// Stop/abort handle shared between an operation and whoever controls it.
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    inner: Arc<Inner>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running operation to finish its current unit and stop with
    /// a consistent partial result.
    pub fn stop(&self) {
        self.inner.signal.fetch_max(STOP_REQUESTED, Ordering::SeqCst);
        let mut state = self.lock_state();
        if *state == OperationState::Running {
            *state = OperationState::StoppingGracefully;
        }
    }

    /// Ask the running operation to give up as soon as possible, without
    /// any consistency guarantee for its output.
    pub fn abort(&self) {
        self.inner.signal.fetch_max(ABORT_REQUESTED, Ordering::SeqCst);
    }

    /// True once stop or abort was requested.
    pub fn should_stop(&self) -> bool {
        self.inner.signal.load(Ordering::SeqCst) >= STOP_REQUESTED
    }

    pub fn is_abort_requested(&self) -> bool {
        self.inner.signal.load(Ordering::SeqCst) >= ABORT_REQUESTED
    }

    pub fn state(&self) -> OperationState {
        *self.lock_state()
    }

    pub(crate) fn begin(&self) {
        self.inner.signal.store(RUNNING, Ordering::SeqCst);
        *self.lock_state() = OperationState::Running;
    }

    pub(crate) fn finish(&self, state: OperationState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OperationState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
