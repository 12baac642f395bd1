//! Executive notifications
//!
//! Observers are how outside layers follow a run. They are called on the
//! dispatch thread and may use the executive freely (request or cancel
//! events, read the clock), but must not call `start`.

use crate::executive::Executive;
use crate::time::SimTime;
use std::rc::Rc;

/// Something that happened to the executive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutiveEvent {
    /// Fired once per Idle→Running transition, before `Started`.
    AboutToStart,
    /// Fired once per Idle→Running transition.
    Started,
    /// The clock is about to move. `now()` still reports `from`.
    ClockAboutToChange { from: SimTime, to: SimTime },
    Paused,
    /// After a pause, or when a stopped executive is started again.
    Resumed,
    Stopped,
    Finished,
    Aborted,
    Reset,
}

/// Registration handle returned by `Executive::subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverFn = dyn Fn(&Executive, &ExecutiveEvent);

#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    list: Vec<(ObserverId, Rc<ObserverFn>)>,
}

impl Observers {
    pub(crate) fn add(&mut self, f: Rc<ObserverFn>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.list.push((id, f));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.list.len();
        self.list.retain(|(oid, _)| *oid != id);
        self.list.len() != before
    }

    /// Copy of the current observers, in registration order, so they can be
    /// called without holding a borrow.
    pub(crate) fn snapshot(&self) -> Vec<Rc<ObserverFn>> {
        self.list.iter().map(|(_, f)| f.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut obs = Observers::default();
        let a = obs.add(Rc::new(|_, _| {}));
        let b = obs.add(Rc::new(|_, _| {}));
        assert_ne!(a, b);
        assert_eq!(obs.snapshot().len(), 2);
        assert!(obs.remove(a));
        assert!(!obs.remove(a));
        assert_eq!(obs.snapshot().len(), 1);
    }
}
