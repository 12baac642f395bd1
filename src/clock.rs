//! Clock controller
//!
//! Owns the simulation's current time and enforces that it never moves
//! backwards. The executive asks `check` first so that "about to change"
//! observers still see the old time, then commits with `advance_to`.

use crate::error::{ExecutiveError, Result};
use crate::event::EventId;
use crate::time::SimTime;

/// A pending move of the clock to a strictly later time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockChange {
    pub from: SimTime,
    pub to: SimTime,
}

#[derive(Debug)]
pub struct ClockController {
    now: SimTime,
    epoch: SimTime,
    /// Number of distinct times the clock has moved to this run.
    advances: u64,
}

impl ClockController {
    pub fn new(epoch: SimTime) -> Self {
        Self {
            now: epoch,
            epoch,
            advances: 0,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn epoch(&self) -> SimTime {
        self.epoch
    }

    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Validate a move to `to` on behalf of `event` without applying it.
    /// Returns the change if `to` is later than now, `None` if equal.
    pub fn check(&self, to: SimTime, event: EventId) -> Result<Option<ClockChange>> {
        if to < self.now {
            return Err(ExecutiveError::CausalityViolation {
                event,
                when: to,
                now: self.now,
            });
        }
        if to == self.now {
            return Ok(None);
        }
        Ok(Some(ClockChange { from: self.now, to }))
    }

    /// Move the clock to `to`.
    pub fn advance_to(&mut self, to: SimTime, event: EventId) -> Result<Option<ClockChange>> {
        let change = self.check(to, event)?;
        if change.is_some() {
            self.now = to;
            self.advances += 1;
        }
        Ok(change)
    }

    /// Return to `epoch` for a fresh run.
    pub fn reset(&mut self, epoch: SimTime) {
        self.now = epoch;
        self.epoch = epoch;
        self.advances = 0;
    }
}
