//! Event records and the handler types they dispatch to.

use crate::context::DetachedContext;
use crate::error::CallbackResult;
use crate::executive::Executive;
use crate::suspend::WaitState;
use crate::time::SimTime;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static HANDLER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_handler_id() -> HandlerId {
    HandlerId(HANDLER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Handle returned for every submitted event, used for cancellation and joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub(crate) u64);

impl EventId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-chosen identity of the object that owns a set of events.
///
/// Only used as a lookup key; the executive never holds the object itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub u64);

/// Stable identity of a handler, shared by all its clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

/// Tie-breaker among events due at the same time. Higher runs first.
pub type Priority = f64;

/// How a record is dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventMode {
    /// Runs inline on the dispatch loop.
    Synchronous,
    /// Runs as a suspendable task.
    Detachable,
    /// Runs inline, re-arms on every clock advance, never counted as pending.
    Daemon,
}

/// Opaque user data passed through to the callback untouched.
#[derive(Clone, Default)]
pub struct Payload(Option<Rc<dyn Any>>);

impl Payload {
    pub fn none() -> Self {
        Payload(None)
    }

    pub fn new<T: Any>(value: T) -> Self {
        Payload(Some(Rc::new(value)))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Payload(..)"),
            None => f.write_str("Payload(none)"),
        }
    }
}

type SyncFn = dyn Fn(&Executive, &Payload) -> CallbackResult;

/// A synchronous callback, used for synchronous and daemon events.
///
/// Cloning keeps the identity, so every clone can be used to cancel events
/// submitted through any other clone.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    f: Rc<SyncFn>,
}

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Executive, &Payload) -> CallbackResult + 'static,
    {
        Self {
            id: next_handler_id(),
            f: Rc::new(f),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn call(&self, exec: &Executive, payload: &Payload) -> CallbackResult {
        (self.f)(exec, payload)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.id).finish()
    }
}

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = CallbackResult>>>;

type DetachFn = dyn Fn(DetachedContext, Payload) -> LocalFuture;

/// A suspendable callback. Each dispatch produces a fresh future that runs
/// on the executive's task executor.
#[derive(Clone)]
pub struct DetachableHandler {
    id: HandlerId,
    f: Rc<DetachFn>,
}

impl DetachableHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(DetachedContext, Payload) -> Fut + 'static,
        Fut: Future<Output = CallbackResult> + 'static,
    {
        Self {
            id: next_handler_id(),
            f: Rc::new(move |ctx, payload| Box::pin(f(ctx, payload)) as LocalFuture),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn invoke(&self, ctx: DetachedContext, payload: Payload) -> LocalFuture {
        (self.f)(ctx, payload)
    }
}

impl fmt::Debug for DetachableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DetachableHandler").field(&self.id).finish()
    }
}

/// What popping a record does.
#[derive(Clone)]
pub(crate) enum Action {
    Call(Handler),
    Detach(DetachableHandler),
    /// Wake a context suspended by `suspend_until`.
    Resume(WaitState),
}

/// One pending callback. Immutable once queued.
#[derive(Clone)]
pub struct EventRecord {
    pub(crate) id: EventId,
    pub(crate) when: SimTime,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) mode: EventMode,
    pub(crate) target: Option<TargetId>,
    pub(crate) payload: Payload,
    pub(crate) action: Action,
}

impl EventRecord {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn when(&self) -> SimTime {
        self.when
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Insertion sequence, the final ordering tiebreak.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn mode(&self) -> EventMode {
        self.mode
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Identity of the user handler; `None` for internal continuations.
    pub fn handler_id(&self) -> Option<HandlerId> {
        match &self.action {
            Action::Call(h) => Some(h.id()),
            Action::Detach(h) => Some(h.id()),
            Action::Resume(_) => None,
        }
    }

    pub fn is_daemon(&self) -> bool {
        self.mode == EventMode::Daemon
    }

    /// Whether this record resumes a suspended context rather than
    /// starting a user callback.
    pub fn is_continuation(&self) -> bool {
        matches!(self.action, Action::Resume(_))
    }

    /// Same record rescheduled at `when` with a new insertion sequence.
    pub(crate) fn rearmed(mut self, when: SimTime, seq: u64) -> Self {
        self.when = when;
        self.seq = seq;
        self
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id)
            .field("when", &self.when)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("mode", &self.mode)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Clone)]
enum RequestKind {
    Synchronous(Handler),
    Detachable(DetachableHandler),
    Daemon(Handler),
}

/// A fully described submission, for callers that need a target or want to
/// pick the mode at runtime.
#[derive(Clone)]
pub struct EventRequest {
    kind: RequestKind,
    pub(crate) when: SimTime,
    pub(crate) priority: Priority,
    pub(crate) payload: Payload,
    pub(crate) target: Option<TargetId>,
}

impl EventRequest {
    fn with_kind(kind: RequestKind, when: SimTime) -> Self {
        Self {
            kind,
            when,
            priority: 0.0,
            payload: Payload::none(),
            target: None,
        }
    }

    pub fn synchronous(handler: &Handler, when: SimTime) -> Self {
        Self::with_kind(RequestKind::Synchronous(handler.clone()), when)
    }

    pub fn detachable(handler: &DetachableHandler, when: SimTime) -> Self {
        Self::with_kind(RequestKind::Detachable(handler.clone()), when)
    }

    pub fn daemon(handler: &Handler, when: SimTime) -> Self {
        Self::with_kind(RequestKind::Daemon(handler.clone()), when)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn mode(&self) -> EventMode {
        match self.kind {
            RequestKind::Synchronous(_) => EventMode::Synchronous,
            RequestKind::Detachable(_) => EventMode::Detachable,
            RequestKind::Daemon(_) => EventMode::Daemon,
        }
    }

    pub(crate) fn into_record(self, id: EventId, seq: u64) -> EventRecord {
        let mode = self.mode();
        let action = match self.kind {
            RequestKind::Synchronous(h) | RequestKind::Daemon(h) => Action::Call(h),
            RequestKind::Detachable(h) => Action::Detach(h),
        };
        EventRecord {
            id,
            when: self.when,
            priority: self.priority,
            seq,
            mode,
            target: self.target,
            payload: self.payload,
            action,
        }
    }
}

/// Read-only view of a pending event.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    pub id: EventId,
    pub when: SimTime,
    pub priority: Priority,
    pub mode: EventMode,
    pub target: Option<TargetId>,
    pub handler: Option<HandlerId>,
}

impl From<&EventRecord> for PendingEvent {
    fn from(r: &EventRecord) -> Self {
        Self {
            id: r.id,
            when: r.when,
            priority: r.priority,
            mode: r.mode,
            target: r.target,
            handler: r.handler_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_identity_survives_clone() {
        let h = Handler::new(|_, _| Ok(()));
        let h2 = h.clone();
        let other = Handler::new(|_, _| Ok(()));
        assert_eq!(h.id(), h2.id());
        assert_ne!(h.id(), other.id());
    }

    #[test]
    fn test_payload_downcast() {
        let p = Payload::new(42u32);
        assert_eq!(p.downcast_ref::<u32>(), Some(&42));
        assert_eq!(p.downcast_ref::<i64>(), None);
        assert!(Payload::none().is_none());
    }

    #[test]
    fn test_request_into_record() {
        let h = Handler::new(|_, _| Ok(()));
        let rec = EventRequest::daemon(&h, SimTime::from_secs(3))
            .priority(2.0)
            .target(TargetId(7))
            .into_record(EventId(11), 4);
        assert_eq!(rec.mode(), EventMode::Daemon);
        assert_eq!(rec.target(), Some(TargetId(7)));
        assert_eq!(rec.handler_id(), Some(h.id()));
        assert!(rec.is_daemon());
        assert!(!rec.is_continuation());
    }
}
