//! Detached Context
//!
//! The handle a detachable callback receives. Provides the clock, access to
//! the executive, and the suspension primitives.

use crate::event::{EventId, Priority};
use crate::executive::{ExecInner, Executive};
use crate::suspend::{SuspendStatus, Suspended, SuspensionController, WaitState};
use crate::sync::JoinCountdown;
use crate::time::SimTime;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// Execution context of one dispatched detachable event.
///
/// Holds only a weak reference to the executive, so contexts kept alive by
/// suspended tasks never keep the executive alive.
#[derive(Clone)]
pub struct DetachedContext {
    exec: Weak<ExecInner>,
    controller: SuspensionController,
    event: EventId,
    priority: Priority,
    /// Clock value last read through this context.
    last_now: Rc<Cell<SimTime>>,
}

impl DetachedContext {
    pub(crate) fn new(
        exec: Weak<ExecInner>,
        controller: SuspensionController,
        event: EventId,
        priority: Priority,
    ) -> Self {
        let now = exec.upgrade().map_or(SimTime::ZERO, |inner| Executive::from_inner(inner).now());
        Self {
            exec,
            controller,
            event,
            priority,
            last_now: Rc::new(Cell::new(now)),
        }
    }

    /// The executive that dispatched this event.
    ///
    /// # Panics
    ///
    /// If called after the executive was dropped; see `try_executive`.
    pub fn executive(&self) -> Executive {
        match self.try_executive() {
            Some(exec) => exec,
            None => panic!("detached context for event {} outlived its executive", self.event),
        }
    }

    /// The executive, or `None` once it has been dropped.
    pub fn try_executive(&self) -> Option<Executive> {
        self.exec.upgrade().map(Executive::from_inner)
    }

    /// Current simulated time. After the executive is dropped, the last
    /// time this context observed.
    pub fn now(&self) -> SimTime {
        if let Some(exec) = self.try_executive() {
            self.last_now.set(exec.now());
        }
        self.last_now.get()
    }

    pub fn event_id(&self) -> EventId {
        self.event
    }

    /// Priority continuation records are scheduled with.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Suspension state of this callback. Clone it to resume the callback
    /// from elsewhere after `suspend`.
    pub fn controller(&self) -> &SuspensionController {
        &self.controller
    }

    /// Suspend until the clock reaches `when`.
    ///
    /// Resumption is an ordinary queue record at `when` carrying this
    /// event's priority, so it is ordered against other events due then.
    /// A `when` equal to `now()` yields to everything already queued at
    /// the current time with equal or higher priority.
    pub fn suspend_until(&self, when: SimTime) -> SuspendUntil {
        SuspendUntil {
            ctx: self.clone(),
            when,
            state: WaitState::new(),
            registered: false,
        }
    }

    pub fn suspend_for(&self, d: Duration) -> SuspendUntil {
        self.suspend_until(self.now() + d)
    }

    /// Suspend until someone calls `resume` on this context's controller.
    pub fn suspend(&self) -> Suspended {
        self.controller.indefinitely()
    }

    /// Suspend until every event in `ids` has completed.
    ///
    /// Ids that are not pending (already complete, cancelled or unknown)
    /// count as complete, as does this context's own event. An event
    /// cancelled after `join` registered is never completed, so the join
    /// does not return.
    pub async fn join(&self, ids: &[EventId]) {
        let Some(exec) = self.try_executive() else {
            return;
        };
        let mut pending: Vec<EventId> = ids
            .iter()
            .copied()
            .filter(|id| *id != self.event && exec.is_pending(*id))
            .collect();
        pending.sort();
        pending.dedup();
        if pending.is_empty() {
            return;
        }

        let countdown = Rc::new(JoinCountdown::new(pending.len(), self.controller.clone()));
        exec.watch_completion(&pending, &countdown);
        drop(exec);
        self.suspend().await;
    }
}

/// Future returned by `DetachedContext::suspend_until`.
pub struct SuspendUntil {
    ctx: DetachedContext,
    when: SimTime,
    state: WaitState,
    registered: bool,
}

impl Future for SuspendUntil {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.state.is_done() {
            this.ctx.controller.leave();
            return Poll::Ready(());
        }

        this.state.set_waker(cx.waker());

        if !this.registered {
            // Only the executive's own executor polls this future.
            let Some(exec) = this.ctx.try_executive() else {
                return Poll::Pending;
            };
            let id = exec.schedule_continuation(this.when, this.ctx.priority, this.state.clone());
            this.ctx.controller.enter(SuspendStatus::Until(this.when));
            this.registered = true;
            tracing::trace!(event = %this.ctx.event, continuation = %id, until = %this.when, "suspended");
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DetachableHandler, Payload};
    use std::cell::RefCell;

    #[test]
    fn test_suspend_for_resumes_at_later_time() {
        let exec = Executive::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let h = DetachableHandler::new(move |ctx: DetachedContext, _| {
            let s = s.clone();
            async move {
                s.borrow_mut().push(ctx.now());
                ctx.suspend_for(Duration::from_secs(5)).await;
                s.borrow_mut().push(ctx.now());
                assert_eq!(ctx.controller().suspensions(), 1);
                Ok(())
            }
        });
        exec.request_detachable_event(&h, SimTime::from_secs(1), 0.0, Payload::none());
        exec.start().unwrap();

        assert_eq!(*seen.borrow(), vec![SimTime::from_secs(1), SimTime::from_secs(6)]);
        assert_eq!(exec.suspended_count(), 0);
    }

    #[test]
    fn test_suspended_status_visible_while_waiting() {
        let exec = Executive::default();
        let handle = Rc::new(RefCell::new(None));
        let hd = handle.clone();
        let h = DetachableHandler::new(move |ctx: DetachedContext, _| {
            *hd.borrow_mut() = Some(ctx.controller().clone());
            async move {
                ctx.suspend_until(SimTime::from_secs(9)).await;
                Ok(())
            }
        });
        exec.request_detachable_event(&h, SimTime::ZERO, 0.0, Payload::none());
        exec.run_until(SimTime::from_secs(4)).unwrap();

        let controller = handle.borrow().clone().unwrap();
        assert_eq!(controller.status(), SuspendStatus::Until(SimTime::from_secs(9)));
        assert_eq!(controller.resume_at(), Some(SimTime::from_secs(9)));
        // Timed suspensions are not resumable by hand.
        assert!(!controller.resume());
        assert_eq!(exec.suspended_count(), 1);
        // The continuation keeps the run alive.
        assert_eq!(exec.event_count(), 1);

        exec.start().unwrap();
        assert!(!controller.is_suspended());
        assert_eq!(exec.now(), SimTime::from_secs(9));
    }

    #[test]
    fn test_context_outliving_executive() {
        let exec = Executive::default();
        let kept: Rc<RefCell<Option<DetachedContext>>> = Rc::new(RefCell::new(None));
        let k = kept.clone();
        let h = DetachableHandler::new(move |ctx: DetachedContext, _| {
            let k = k.clone();
            async move {
                ctx.suspend_until(SimTime::from_secs(3)).await;
                assert_eq!(ctx.now(), SimTime::from_secs(3));
                *k.borrow_mut() = Some(ctx);
                Ok(())
            }
        });
        exec.request_detachable_event(&h, SimTime::from_secs(1), 0.0, Payload::none());
        let noop = crate::event::Handler::new(|_, _| Ok(()));
        exec.request_event(&noop, SimTime::from_secs(8), 0.0, Payload::none());
        exec.start().unwrap();
        drop(exec);

        let ctx = kept.borrow_mut().take().unwrap();
        assert!(ctx.try_executive().is_none());
        assert_eq!(ctx.now(), SimTime::from_secs(3));
    }

    #[test]
    fn test_join_on_completed_ids_returns_immediately() {
        let exec = Executive::default();
        let done = Rc::new(RefCell::new(false));
        let d = done.clone();
        let h = DetachableHandler::new(move |ctx: DetachedContext, _| {
            let d = d.clone();
            async move {
                ctx.join(&[EventId(999), ctx.event_id()]).await;
                *d.borrow_mut() = true;
                Ok(())
            }
        });
        exec.request_detachable_event(&h, SimTime::ZERO, 0.0, Payload::none());
        exec.start().unwrap();
        assert!(*done.borrow());
    }
}
