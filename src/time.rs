//! Simulated time
//!
//! `SimTime` is an absolute point on the simulation timeline, stored as a
//! nanosecond-resolution offset from the epoch. Unlike wall-clock instants it
//! is totally ordered and fully deterministic.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// An absolute simulated timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(Duration);

impl SimTime {
    /// The epoch every simulation starts from unless configured otherwise.
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    /// The latest representable time.
    pub const MAX: SimTime = SimTime(Duration::MAX);

    pub const fn from_duration(offset: Duration) -> Self {
        SimTime(offset)
    }

    pub const fn from_secs(secs: u64) -> Self {
        SimTime(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        SimTime(Duration::from_millis(millis))
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        SimTime(Duration::from_nanos(nanos))
    }

    /// Offset from the epoch.
    pub const fn since_epoch(self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    pub fn checked_add(self, d: Duration) -> Option<SimTime> {
        self.0.checked_add(d).map(SimTime)
    }

    pub fn checked_sub(self, d: Duration) -> Option<SimTime> {
        self.0.checked_sub(d).map(SimTime)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_add(rhs))
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

impl From<Duration> for SimTime {
    fn from(offset: Duration) -> Self {
        SimTime(offset)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T+{:.9}s", self.0.as_secs_f64())
    }
}
