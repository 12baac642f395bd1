//! Lifecycle state shared across threads
//!
//! The dispatch loop runs on one thread, but pause/resume/stop/abort may be
//! requested from any thread. Requests are recorded here and honoured by the
//! loop between dispatches; a paused loop parks on the condition variable.

use crate::error::{ExecutiveError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// Executive lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Finished,
    Aborted,
}

impl ExecState {
    /// States that only `reset` leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecState::Finished | ExecState::Aborted)
    }

    /// Whether a dispatch loop is currently active.
    pub fn is_active(self) -> bool {
        matches!(self, ExecState::Running | ExecState::Paused)
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecState::Idle => "idle",
            ExecState::Running => "running",
            ExecState::Paused => "paused",
            ExecState::Stopped => "stopped",
            ExecState::Finished => "finished",
            ExecState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A lifecycle request waiting for the loop's next safe point.
/// Ordered by precedence: a later variant overrides an earlier one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ControlRequest {
    Pause,
    Stop,
    Abort,
}

#[derive(Default)]
pub(crate) struct ControlInner {
    pub(crate) state: ExecState,
    pub(crate) request: Option<ControlRequest>,
    /// Set by `resume` while paused.
    pub(crate) resume: bool,
}

impl ControlInner {
    fn post(&mut self, req: ControlRequest) {
        if self.request.map_or(true, |r| req > r) {
            self.request = Some(req);
        }
    }
}

#[derive(Default)]
pub(crate) struct ControlShared {
    inner: Mutex<ControlInner>,
    cv: Condvar,
}

impl ControlShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock()
    }

    pub(crate) fn state(&self) -> ExecState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ExecState) {
        self.inner.lock().state = state;
    }

    /// Block the calling (loop) thread until a request arrives.
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, ControlInner>) {
        self.cv.wait(guard);
    }

    pub(crate) fn pause(&self) -> Result<()> {
        let mut g = self.inner.lock();
        match g.state {
            ExecState::Running => {
                g.post(ControlRequest::Pause);
                Ok(())
            }
            // Already paused or pausing.
            ExecState::Paused => Ok(()),
            s => Err(ExecutiveError::invalid(s, "pause")),
        }
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let mut g = self.inner.lock();
        match g.state {
            ExecState::Paused => {
                g.resume = true;
                drop(g);
                self.cv.notify_all();
                Ok(())
            }
            // A pause that has not been honoured yet is withdrawn.
            ExecState::Running if g.request == Some(ControlRequest::Pause) => {
                g.request = None;
                Ok(())
            }
            s => Err(ExecutiveError::invalid(s, "resume")),
        }
    }

    pub(crate) fn stop(&self) -> Result<()> {
        self.post_active(ControlRequest::Stop, "stop")
    }

    pub(crate) fn request_abort(&self) -> Result<()> {
        self.post_active(ControlRequest::Abort, "abort")
    }

    fn post_active(&self, req: ControlRequest, operation: &'static str) -> Result<()> {
        let mut g = self.inner.lock();
        if !g.state.is_active() {
            return Err(ExecutiveError::invalid(g.state, operation));
        }
        g.post(req);
        drop(g);
        self.cv.notify_all();
        Ok(())
    }
}

/// Thread-safe handle for driving an executive's lifecycle from other
/// threads. Obtained from `Executive::controller`.
#[derive(Clone)]
pub struct ExecutiveController {
    pub(crate) shared: Arc<ControlShared>,
}

impl ExecutiveController {
    pub fn state(&self) -> ExecState {
        self.shared.state()
    }

    /// Ask the loop to pause before its next dispatch.
    pub fn pause(&self) -> Result<()> {
        self.shared.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Ask the loop to stop before its next dispatch. `start` returns and a
    /// later `start` continues from the same queue.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop()
    }

    /// Ask the loop to abort before its next dispatch. Only valid while a
    /// loop is active; use `Executive::abort` otherwise.
    pub fn abort(&self) -> Result<()> {
        self.shared.request_abort()
    }
}

impl fmt::Debug for ExecutiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutiveController")
            .field("state", &self.state())
            .finish()
    }
}
