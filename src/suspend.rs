//! Suspension primitives for detachable callbacks
//!
//! `WaitState` is the one-shot flag shared between a continuation record in
//! the event queue and the future awaiting it. `SuspensionController` tracks
//! one detachable event's suspensions and lets other code resume it when it
//! is suspended indefinitely.

use crate::event::EventId;
use crate::time::SimTime;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Shared wait state between a suspended future and whoever completes it.
#[derive(Clone, Default)]
pub struct WaitState {
    inner: Rc<RefCell<WaitStateInner>>,
}

#[derive(Default)]
struct WaitStateInner {
    done: bool,
    waker: Option<Waker>,
}

impl WaitState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_waker(&self, w: &Waker) {
        self.inner.borrow_mut().waker = Some(w.clone());
    }

    /// Mark done and wake the waiter. Later calls do nothing.
    pub fn complete(&self) {
        let waker = {
            let mut s = self.inner.borrow_mut();
            if s.done {
                return;
            }
            s.done = true;
            s.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.borrow().done
    }
}

/// Where a detachable callback currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendStatus {
    Running,
    /// Waiting for a continuation record due at the given time.
    Until(SimTime),
    /// Waiting for `SuspensionController::resume`.
    Indefinite,
}

struct ControllerInner {
    event: EventId,
    status: SuspendStatus,
    waker: Option<Waker>,
    resume_requested: bool,
    suspensions: u64,
}

/// Per-event suspension state of a detachable callback.
///
/// Clones share state; hand a clone to whatever should wake the callback.
#[derive(Clone)]
pub struct SuspensionController {
    inner: Rc<RefCell<ControllerInner>>,
}

impl SuspensionController {
    pub(crate) fn new(event: EventId) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ControllerInner {
                event,
                status: SuspendStatus::Running,
                waker: None,
                resume_requested: false,
                suspensions: 0,
            })),
        }
    }

    /// The detachable event this controller belongs to.
    pub fn event_id(&self) -> EventId {
        self.inner.borrow().event
    }

    pub fn status(&self) -> SuspendStatus {
        self.inner.borrow().status
    }

    pub fn is_suspended(&self) -> bool {
        self.status() != SuspendStatus::Running
    }

    /// The time a timed suspension will resume at.
    pub fn resume_at(&self) -> Option<SimTime> {
        match self.status() {
            SuspendStatus::Until(t) => Some(t),
            _ => None,
        }
    }

    /// How many times the callback has suspended so far.
    pub fn suspensions(&self) -> u64 {
        self.inner.borrow().suspensions
    }

    /// Wake an indefinitely suspended callback. It continues on the
    /// dispatch loop at the current simulated time, after the code that
    /// called `resume` returns.
    ///
    /// Returns false, and does nothing, if the callback is not suspended
    /// indefinitely or a resume is already pending.
    pub fn resume(&self) -> bool {
        let waker = {
            let mut s = self.inner.borrow_mut();
            if s.status != SuspendStatus::Indefinite || s.resume_requested {
                return false;
            }
            s.resume_requested = true;
            s.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    pub(crate) fn enter(&self, status: SuspendStatus) {
        let mut s = self.inner.borrow_mut();
        s.status = status;
        s.suspensions += 1;
    }

    pub(crate) fn leave(&self) {
        let mut s = self.inner.borrow_mut();
        s.status = SuspendStatus::Running;
        s.resume_requested = false;
    }

    /// Future that parks until `resume` is called.
    pub(crate) fn indefinitely(&self) -> Suspended {
        Suspended {
            controller: self.clone(),
            registered: false,
        }
    }
}

/// Future returned by `DetachedContext::suspend`.
pub struct Suspended {
    controller: SuspensionController,
    registered: bool,
}

impl Future for Suspended {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if !this.registered {
            this.controller.enter(SuspendStatus::Indefinite);
            this.registered = true;
        } else if this.controller.inner.borrow().resume_requested {
            this.controller.leave();
            return Poll::Ready(());
        }

        this.controller.inner.borrow_mut().waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
