//! Executive - the dispatch loop and its lifecycle
//!
//! Ties the event queue, clock, task executor and lifecycle control
//! together. One executive drives one timeline on one thread; other threads
//! talk to it through `ExecutiveController`.

use crate::clock::{ClockChange, ClockController};
use crate::config::{ExecutiveConfig, Pacing};
use crate::context::DetachedContext;
use crate::control::{ControlRequest, ControlShared, ExecState, ExecutiveController};
use crate::error::{CallbackError, CallbackResult, ExecutiveError, Result};
use crate::event::{
    Action, DetachableHandler, EventId, EventMode, EventRecord, EventRequest, Handler, HandlerId,
    LocalFuture, Payload, PendingEvent, Priority, TargetId,
};
use crate::executor::Executor;
use crate::observer::{ExecutiveEvent, ObserverId, Observers};
use crate::pq::EventQueue;
use crate::suspend::{SuspensionController, WaitState};
use crate::sync::{JoinCountdown, Rendezvous};
use crate::time::SimTime;
use spin_sleep::SpinSleeper;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wall-clock sleep while pacing, so control requests are
/// noticed promptly.
const PACING_SLICE: Duration = Duration::from_millis(10);

/// Wall-clock anchor for real-time pacing.
struct Pacer {
    sleeper: SpinSleeper,
    wall_anchor: Instant,
    sim_anchor: SimTime,
}

impl Pacer {
    fn new(now: SimTime) -> Self {
        Self {
            sleeper: SpinSleeper::default(),
            wall_anchor: Instant::now(),
            sim_anchor: now,
        }
    }

    fn anchor(&mut self, now: SimTime) {
        self.wall_anchor = Instant::now();
        self.sim_anchor = now;
    }

    /// Wall instant at which `when` is due, `None` if it is out of range.
    fn deadline(&self, when: SimTime, rate: f64) -> Option<Instant> {
        let dt = (when - self.sim_anchor).as_secs_f64() / rate;
        let dt = Duration::try_from_secs_f64(dt).ok()?;
        self.wall_anchor.checked_add(dt)
    }
}

pub(crate) struct ExecInner {
    config: ExecutiveConfig,
    queue: RefCell<EventQueue>,
    clock: RefCell<ClockController>,
    tasks: Executor,
    next_id: Cell<u64>,
    next_seq: Cell<u64>,
    /// Daemons that fired at the current time and re-arm on the next advance.
    armed_daemons: RefCell<Vec<EventRecord>>,
    /// Detachable events whose future has not completed.
    running: RefCell<HashSet<EventId>>,
    joins: RefCell<HashMap<EventId, Vec<Rc<JoinCountdown>>>>,
    rendezvous: RefCell<HashMap<String, Rendezvous>>,
    observers: RefCell<Observers>,
    /// First error raised by a detachable callback, surfaced by the loop.
    failure: RefCell<Option<ExecutiveError>>,
    control: Arc<ControlShared>,
    in_loop: Cell<bool>,
    current: Cell<Option<EventId>>,
    run_number: Cell<u64>,
    dispatched: Cell<u64>,
    pacer: RefCell<Pacer>,
}

/// The simulation executive.
///
/// Cheap to clone; clones share the same timeline. Not `Send`: the
/// executive lives on the thread that created it. Use `controller()` to
/// pause, resume, stop or abort it from elsewhere.
#[derive(Clone)]
pub struct Executive(Rc<ExecInner>);

impl Default for Executive {
    fn default() -> Self {
        Self::new(ExecutiveConfig::default())
    }
}

impl Executive {
    pub fn new(config: ExecutiveConfig) -> Self {
        let start = config.start_time;
        Executive(Rc::new(ExecInner {
            queue: RefCell::new(EventQueue::new()),
            clock: RefCell::new(ClockController::new(start)),
            tasks: Executor::new(),
            next_id: Cell::new(0),
            next_seq: Cell::new(0),
            armed_daemons: RefCell::new(Vec::new()),
            running: RefCell::new(HashSet::new()),
            joins: RefCell::new(HashMap::new()),
            rendezvous: RefCell::new(HashMap::new()),
            observers: RefCell::new(Observers::default()),
            failure: RefCell::new(None),
            control: Arc::new(ControlShared::default()),
            in_loop: Cell::new(false),
            current: Cell::new(None),
            run_number: Cell::new(0),
            dispatched: Cell::new(0),
            pacer: RefCell::new(Pacer::new(start)),
            config,
        }))
    }

    pub(crate) fn from_inner(inner: Rc<ExecInner>) -> Self {
        Executive(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ExecInner> {
        Rc::downgrade(&self.0)
    }

    pub fn config(&self) -> &ExecutiveConfig {
        &self.0.config
    }

    /// Thread-safe lifecycle handle.
    pub fn controller(&self) -> ExecutiveController {
        ExecutiveController {
            shared: self.0.control.clone(),
        }
    }

    // --- Queries ---

    pub fn now(&self) -> SimTime {
        self.0.clock.borrow().now()
    }

    pub fn state(&self) -> ExecState {
        self.0.control.state()
    }

    /// Pending events, daemons excluded.
    pub fn event_count(&self) -> usize {
        self.0.queue.borrow().non_daemon_len()
    }

    /// Number of Idle→Running transitions since creation.
    pub fn run_number(&self) -> u64 {
        self.0.run_number.get()
    }

    /// Records dispatched in the current run.
    pub fn dispatch_count(&self) -> u64 {
        self.0.dispatched.get()
    }

    /// Detachable callbacks that started but have not completed.
    pub fn suspended_count(&self) -> usize {
        self.0.tasks.live_tasks()
    }

    /// Event whose callback is executing, including a detachable callback
    /// that has resumed from a suspension.
    pub fn current_event(&self) -> Option<EventId> {
        self.0.current.get()
    }

    /// Pending events in dispatch order, daemons excluded.
    pub fn pending_events(&self) -> Vec<PendingEvent> {
        self.0
            .queue
            .borrow()
            .iter_ordered()
            .into_iter()
            .filter(|r| !r.is_daemon())
            .map(PendingEvent::from)
            .collect()
    }

    /// Whether `id` is queued, armed, or a detachable callback still running.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.0.queue.borrow().get(id).is_some_and(|r| !r.is_continuation())
            || self.0.running.borrow().contains(&id)
            || self.0.armed_daemons.borrow().iter().any(|r| r.id == id)
    }

    // --- Submission ---

    /// Schedule a synchronous callback.
    pub fn request_event(
        &self,
        handler: &Handler,
        when: SimTime,
        priority: Priority,
        payload: Payload,
    ) -> EventId {
        self.submit(
            EventRequest::synchronous(handler, when)
                .priority(priority)
                .payload(payload),
        )
    }

    /// Schedule a callback that may suspend itself.
    pub fn request_detachable_event(
        &self,
        handler: &DetachableHandler,
        when: SimTime,
        priority: Priority,
        payload: Payload,
    ) -> EventId {
        self.submit(
            EventRequest::detachable(handler, when)
                .priority(priority)
                .payload(payload),
        )
    }

    /// Schedule a daemon: it fires at `when` and then once at every later
    /// clock value, is never counted as pending, and does not keep a run
    /// alive on its own.
    pub fn request_daemon_event(
        &self,
        handler: &Handler,
        when: SimTime,
        priority: Priority,
        payload: Payload,
    ) -> EventId {
        self.submit(
            EventRequest::daemon(handler, when)
                .priority(priority)
                .payload(payload),
        )
    }

    /// Schedule a fully described request.
    ///
    /// A `when` earlier than the clock is accepted here; the run fails with
    /// a causality violation if the record is ever reached.
    pub fn submit(&self, request: EventRequest) -> EventId {
        let id = self.alloc_id();
        let seq = self.alloc_seq();
        if request.when < self.now() {
            tracing::warn!(event = %id, when = %request.when, now = %self.now(), "event requested in the past");
        }
        self.enqueue(request.into_record(id, seq));
        id
    }

    pub(crate) fn schedule_continuation(
        &self,
        when: SimTime,
        priority: Priority,
        state: WaitState,
    ) -> EventId {
        let id = self.alloc_id();
        if self.state() == ExecState::Aborted {
            // The task was dropped by the abort and will never be polled again.
            return id;
        }
        let record = EventRecord {
            id,
            when,
            priority,
            seq: self.alloc_seq(),
            mode: EventMode::Detachable,
            target: None,
            payload: Payload::none(),
            action: Action::Resume(state),
        };
        self.enqueue(record);
        id
    }

    fn alloc_id(&self) -> EventId {
        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);
        EventId(id)
    }

    fn alloc_seq(&self) -> u64 {
        let s = self.0.next_seq.get();
        self.0.next_seq.set(s + 1);
        s
    }

    fn enqueue(&self, record: EventRecord) {
        let id = record.id;
        let inserted = self.0.queue.borrow_mut().insert(record);
        debug_assert!(inserted.is_ok(), "event id {id} allocated twice");
    }

    // --- Cancellation ---

    /// Cancel a pending event. Unknown, dispatched or suspended events are
    /// left alone. Returns whether anything was removed.
    pub fn unrequest_event(&self, id: EventId) -> bool {
        let queued: Vec<EventRecord> = {
            let mut q = self.0.queue.borrow_mut();
            match q.get(id) {
                Some(r) if !r.is_continuation() => q.remove_by_id(id).into_iter().collect(),
                _ => Vec::new(),
            }
        };
        self.cancelled(queued, |r| r.id == id) > 0
    }

    /// Cancel every pending event owned by `target`.
    pub fn unrequest_events_for_target(&self, target: TargetId) -> usize {
        let queued = self.0.queue.borrow_mut().remove_by_target(target);
        self.cancelled(queued, |r| r.target == Some(target))
    }

    /// Cancel every pending event submitted with the given handler.
    pub fn unrequest_events_for_handler(&self, handler: HandlerId) -> usize {
        let queued = self
            .0
            .queue
            .borrow_mut()
            .remove_where(|r| r.handler_id() == Some(handler));
        self.cancelled(queued, |r| r.handler_id() == Some(handler))
    }

    /// Finish a cancellation: also drop matching armed daemons, and forget
    /// join watchers of every removed id. Returns the number removed.
    fn cancelled<F: Fn(&EventRecord) -> bool>(&self, mut removed: Vec<EventRecord>, pred: F) -> usize {
        {
            let mut armed = self.0.armed_daemons.borrow_mut();
            let (gone, kept): (Vec<_>, Vec<_>) = armed.drain(..).partition(|r| pred(r));
            *armed = kept;
            removed.extend(gone);
        }
        let mut joins = self.0.joins.borrow_mut();
        for r in &removed {
            // Joiners on a cancelled event are never resumed.
            joins.remove(&r.id);
        }
        removed.len()
    }

    // --- Notifications ---

    pub fn subscribe<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&Executive, &ExecutiveEvent) + 'static,
    {
        self.0.observers.borrow_mut().add(Rc::new(f))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.0.observers.borrow_mut().remove(id)
    }

    fn notify(&self, event: ExecutiveEvent) {
        let observers = self.0.observers.borrow().snapshot();
        for f in observers {
            f(self, &event);
        }
    }

    // --- Synchronization ---

    /// Rendezvous registered under `key` on this executive, created with
    /// `parties` participants on first use.
    pub fn rendezvous(&self, key: &str, parties: usize) -> Rendezvous {
        self.0
            .rendezvous
            .borrow_mut()
            .entry(key.to_string())
            .or_insert_with(|| Rendezvous::new(parties))
            .clone()
    }

    /// Resume `countdown`'s waiter once every id in `ids` has completed.
    pub(crate) fn watch_completion(&self, ids: &[EventId], countdown: &Rc<JoinCountdown>) {
        let mut joins = self.0.joins.borrow_mut();
        for id in ids {
            joins.entry(*id).or_default().push(countdown.clone());
        }
    }

    fn complete(&self, id: EventId) {
        let watchers = self.0.joins.borrow_mut().remove(&id);
        for countdown in watchers.into_iter().flatten() {
            countdown.arrive();
        }
    }

    // --- Lifecycle ---

    /// Run until the queue holds no more non-daemon events, or until the
    /// run is stopped, aborted or fails.
    ///
    /// Calling `start` from inside a callback is a no-op. A stopped or
    /// paused executive continues where it left off.
    pub fn start(&self) -> Result<()> {
        self.run(None)
    }

    /// Like `start`, but stop before dispatching anything due after `limit`.
    pub fn run_until(&self, limit: SimTime) -> Result<()> {
        self.run(Some(limit))
    }

    /// Pause before the next dispatch. The dispatching thread blocks until
    /// `resume` is called, typically through a controller on another thread.
    pub fn pause(&self) -> Result<()> {
        self.0.control.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.0.control.resume()
    }

    /// Stop before the next dispatch; `start` continues from the same queue.
    pub fn stop(&self) -> Result<()> {
        self.0.control.stop()
    }

    /// Clear all pending work immediately and move to `Aborted`.
    pub fn abort(&self) {
        self.clear_pending();
        self.0.control.set_state(ExecState::Aborted);
        tracing::debug!(now = %self.now(), "executive aborted");
        self.notify(ExecutiveEvent::Aborted);
    }

    /// Return to `Idle` with an empty queue and the clock at the start time.
    pub fn reset(&self) -> Result<()> {
        let state = self.state();
        if state.is_active() || self.0.in_loop.get() {
            return Err(ExecutiveError::invalid(state, "reset"));
        }
        self.clear_pending();
        self.0.rendezvous.borrow_mut().clear();
        self.0.failure.borrow_mut().take();
        self.0.clock.borrow_mut().reset(self.0.config.start_time);
        self.0.dispatched.set(0);
        {
            let mut g = self.0.control.lock();
            g.state = ExecState::Idle;
            g.request = None;
            g.resume = false;
        }
        tracing::debug!("executive reset");
        self.notify(ExecutiveEvent::Reset);
        Ok(())
    }

    fn clear_pending(&self) {
        self.0.queue.borrow_mut().clear();
        self.0.armed_daemons.borrow_mut().clear();
        self.0.running.borrow_mut().clear();
        self.0.joins.borrow_mut().clear();
        self.0.tasks.clear();
    }

    fn run(&self, limit: Option<SimTime>) -> Result<()> {
        if self.0.in_loop.get() {
            return Ok(());
        }

        let state = self.state();
        match state {
            s if s.is_terminal() => return Err(ExecutiveError::invalid(s, "start")),
            ExecState::Idle => {
                self.notify(ExecutiveEvent::AboutToStart);
                self.0.run_number.set(self.0.run_number.get() + 1);
                self.0.dispatched.set(0);
                self.enter_running();
                tracing::debug!(run = self.run_number(), now = %self.now(), "executive started");
                self.notify(ExecutiveEvent::Started);
            }
            ExecState::Stopped | ExecState::Paused => {
                self.enter_running();
                tracing::debug!(now = %self.now(), "executive resumed");
                self.notify(ExecutiveEvent::Resumed);
            }
            _ => return Ok(()),
        }

        self.0.in_loop.set(true);
        self.0.pacer.borrow_mut().anchor(self.now());
        let result = self.dispatch_loop(limit);
        self.0.in_loop.set(false);

        if let Err(e) = &result {
            tracing::warn!(error = %e, now = %self.now(), "run failed");
            self.0.control.set_state(ExecState::Aborted);
            self.notify(ExecutiveEvent::Aborted);
        }
        result
    }

    fn enter_running(&self) {
        let mut g = self.0.control.lock();
        g.state = ExecState::Running;
        g.request = None;
        g.resume = false;
    }

    fn dispatch_loop(&self, limit: Option<SimTime>) -> Result<()> {
        loop {
            if self.safe_point() {
                return Ok(());
            }

            self.0.tasks.run_until_stalled();
            self.take_failure()?;
            if self.state() != ExecState::Running {
                // Aborted from inside a callback.
                return Ok(());
            }

            let Some((id, when)) = self.next_due() else {
                self.halt(ExecState::Finished);
                return Ok(());
            };

            if limit.is_some_and(|limit| when > limit) {
                self.halt(ExecState::Stopped);
                return Ok(());
            }

            let change = self.0.clock.borrow().check(when, id)?;
            if let Some(change) = change {
                if !self.pace(change.to) {
                    // A control request arrived while waiting.
                    continue;
                }
                self.advance_clock(change)?;
                // Observers and re-armed daemons may have changed the head.
                continue;
            }

            let record = self.0.queue.borrow_mut().pop_min()?;
            debug_assert_eq!(record.id, id);

            let dispatched = self.0.dispatched.get() + 1;
            self.0.dispatched.set(dispatched);
            if let Some(limit) = self.0.config.dispatch_limit {
                if dispatched > limit {
                    return Err(ExecutiveError::DispatchLimitExceeded { limit });
                }
            }

            self.dispatch(record)?;
            self.0.tasks.run_until_stalled();
            self.take_failure()?;
        }
    }

    /// Head of the queue, unless only daemons are left.
    fn next_due(&self) -> Option<(EventId, SimTime)> {
        let mut q = self.0.queue.borrow_mut();
        if q.non_daemon_len() == 0 {
            return None;
        }
        q.peek_min().map(|r| (r.id, r.when))
    }

    /// Announce `change`, then move the clock if the head is still due at
    /// `change.to`. Observers may cancel the head or request something
    /// earlier; the clock then stays put and the loop looks again.
    fn advance_clock(&self, change: ClockChange) -> Result<()> {
        tracing::trace!(from = %change.from, to = %change.to, "clock advancing");
        self.notify(ExecutiveEvent::ClockAboutToChange {
            from: change.from,
            to: change.to,
        });

        let Some((id, when)) = self.next_due() else {
            tracing::trace!(to = %change.to, "clock change withdrawn");
            return Ok(());
        };
        if when != change.to {
            tracing::trace!(to = %change.to, head = %when, "clock change withdrawn");
            return Ok(());
        }
        self.0.clock.borrow_mut().advance_to(change.to, id)?;

        let armed = std::mem::take(&mut *self.0.armed_daemons.borrow_mut());
        for record in armed {
            let seq = self.alloc_seq();
            self.enqueue(record.rearmed(change.to, seq));
        }
        Ok(())
    }

    fn dispatch(&self, record: EventRecord) -> Result<()> {
        tracing::trace!(
            event = %record.id,
            when = %record.when,
            priority = record.priority,
            mode = ?record.mode,
            "dispatch"
        );
        match &record.action {
            Action::Call(handler) => {
                let id = record.id;
                if record.is_daemon() {
                    // Armed before the call so the callback can cancel itself.
                    self.0.armed_daemons.borrow_mut().push(record.clone());
                }
                let prev = self.0.current.replace(Some(id));
                let result = handler.call(self, &record.payload);
                self.0.current.set(prev);
                result.map_err(|source| self.callback_failed(id, source))?;
                self.complete(id);
            }
            Action::Detach(handler) => self.spawn_detached(handler, &record),
            Action::Resume(state) => state.complete(),
        }
        Ok(())
    }

    fn spawn_detached(&self, handler: &DetachableHandler, record: &EventRecord) {
        let id = record.id;
        let controller = SuspensionController::new(id);
        let ctx = DetachedContext::new(self.downgrade(), controller, id, record.priority);
        let fut = Attributed {
            exec: self.downgrade(),
            event: id,
            fut: handler.invoke(ctx, record.payload.clone()),
        };

        self.0.running.borrow_mut().insert(id);
        let exec = self.downgrade();
        self.0.tasks.spawn(async move {
            let result = fut.await;
            if let Some(inner) = exec.upgrade() {
                Executive(inner).detached_finished(id, result);
            }
        });
    }

    fn detached_finished(&self, id: EventId, result: CallbackResult) {
        self.0.running.borrow_mut().remove(&id);
        match result {
            Ok(()) => self.complete(id),
            Err(source) => {
                let err = self.callback_failed(id, source);
                self.0.failure.borrow_mut().get_or_insert(err);
            }
        }
    }

    fn callback_failed(&self, event: EventId, source: CallbackError) -> ExecutiveError {
        let at = self.now();
        tracing::warn!(event = %event, at = %at, error = %source, "callback failed");
        ExecutiveError::Callback { event, at, source }
    }

    fn take_failure(&self) -> Result<()> {
        match self.0.failure.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn halt(&self, state: ExecState) {
        self.0.control.set_state(state);
        tracing::debug!(%state, now = %self.now(), dispatched = self.dispatch_count(), "executive halted");
        match state {
            ExecState::Finished => self.notify(ExecutiveEvent::Finished),
            ExecState::Stopped => self.notify(ExecutiveEvent::Stopped),
            _ => {}
        }
    }

    /// Honour pending control requests. Returns true if the loop must exit.
    fn safe_point(&self) -> bool {
        match self.take_request() {
            None => false,
            Some(ControlRequest::Abort) => {
                self.abort();
                true
            }
            Some(ControlRequest::Stop) => {
                self.halt(ExecState::Stopped);
                true
            }
            Some(ControlRequest::Pause) => self.park(),
        }
    }

    /// Take the pending control request. A pause takes effect under the
    /// same lock, so a concurrent `resume` always finds `Paused`.
    fn take_request(&self) -> Option<ControlRequest> {
        let mut g = self.0.control.lock();
        let request = g.request.take();
        if request == Some(ControlRequest::Pause) {
            g.state = ExecState::Paused;
            g.resume = false;
        }
        request
    }

    /// Block while paused. Returns true if the loop must exit.
    fn park(&self) -> bool {
        tracing::debug!(now = %self.now(), "executive paused");
        self.notify(ExecutiveEvent::Paused);

        let outcome = {
            let mut g = self.0.control.lock();
            loop {
                match g.request.take() {
                    Some(ControlRequest::Pause) | None => {}
                    Some(other) => break Some(other),
                }
                if g.resume {
                    g.resume = false;
                    g.state = ExecState::Running;
                    break None;
                }
                self.0.control.wait(&mut g);
            }
        };

        match outcome {
            None => {
                self.0.pacer.borrow_mut().anchor(self.now());
                tracing::debug!(now = %self.now(), "executive resumed");
                self.notify(ExecutiveEvent::Resumed);
                false
            }
            Some(ControlRequest::Stop) => {
                self.halt(ExecState::Stopped);
                true
            }
            Some(_) => {
                self.abort();
                true
            }
        }
    }

    /// Wait for the wall-clock time matching `when` under real-time pacing.
    /// Returns false if a control request interrupted the wait.
    fn pace(&self, when: SimTime) -> bool {
        let Pacing::RealTime { rate } = self.0.config.pacing else {
            return true;
        };
        let Some(deadline) = self.0.pacer.borrow().deadline(when, rate) else {
            return true;
        };
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if self.0.control.lock().request.is_some() {
                return false;
            }
            let slice = (deadline - now).min(PACING_SLICE);
            self.0.pacer.borrow().sleeper.sleep(slice);
        }
    }
}

/// Reports `event` as the current event while its future is polled.
struct Attributed {
    exec: Weak<ExecInner>,
    event: EventId,
    fut: LocalFuture,
}

impl Future for Attributed {
    type Output = CallbackResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CallbackResult> {
        let this = self.get_mut();
        let inner = this.exec.upgrade();
        let prev = inner.as_ref().map(|i| i.current.replace(Some(this.event)));
        let poll = this.fut.as_mut().poll(cx);
        if let (Some(i), Some(prev)) = (inner, prev) {
            i.current.set(prev);
        }
        poll
    }
}

impl fmt::Debug for Executive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executive")
            .field("state", &self.state())
            .field("now", &self.now())
            .field("event_count", &self.event_count())
            .finish()
    }
}
