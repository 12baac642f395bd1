//! Synchronization points between detachable callbacks
//!
//! Joins let one callback wait for a set of events to complete. A
//! rendezvous holds callbacks until a fixed number of them have arrived,
//! then releases them all at the current simulated time.

use crate::context::DetachedContext;
use crate::suspend::SuspensionController;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Countdown of outstanding events for one `join`.
pub(crate) struct JoinCountdown {
    remaining: Cell<usize>,
    waiter: SuspensionController,
}

impl JoinCountdown {
    pub(crate) fn new(remaining: usize, waiter: SuspensionController) -> Self {
        Self {
            remaining: Cell::new(remaining),
            waiter,
        }
    }

    /// One watched event completed. The last one resumes the waiter.
    pub(crate) fn arrive(&self) {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            self.waiter.resume();
        }
    }
}

struct RendezvousState {
    parties: usize,
    generation: u64,
    waiting: Vec<SuspensionController>,
}

/// A reusable meeting point for a fixed number of detachable callbacks.
///
/// Each `arrive` suspends until `parties` callbacks have arrived in the
/// current generation. The last arrival releases the others in arrival
/// order and does not suspend itself.
#[derive(Clone)]
pub struct Rendezvous(Rc<RefCell<RendezvousState>>);

impl Rendezvous {
    /// A `parties` of zero is treated as one.
    pub fn new(parties: usize) -> Self {
        Rendezvous(Rc::new(RefCell::new(RendezvousState {
            parties: parties.max(1),
            generation: 0,
            waiting: Vec::new(),
        })))
    }

    pub fn parties(&self) -> usize {
        self.0.borrow().parties
    }

    /// Completed release cycles.
    pub fn generation(&self) -> u64 {
        self.0.borrow().generation
    }

    /// Callbacks currently waiting.
    pub fn waiting(&self) -> usize {
        self.0.borrow().waiting.len()
    }

    /// Arrive and wait for the rest of the parties. Returns the generation
    /// this arrival belonged to.
    pub async fn arrive(&self, ctx: &DetachedContext) -> u64 {
        let (generation, released) = {
            let mut s = self.0.borrow_mut();
            let generation = s.generation;
            if s.waiting.len() + 1 >= s.parties {
                s.generation += 1;
                (generation, Some(std::mem::take(&mut s.waiting)))
            } else {
                s.waiting.push(ctx.controller().clone());
                (generation, None)
            }
        };

        match released {
            Some(waiters) => {
                tracing::trace!(generation, released = waiters.len(), "rendezvous complete");
                for w in waiters {
                    w.resume();
                }
            }
            None => ctx.suspend().await,
        }
        generation
    }
}
