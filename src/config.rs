//! Executive configuration

use crate::time::SimTime;

/// How simulated time relates to wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pacing {
    /// Dispatch as fast as possible.
    AsFastAsPossible,
    /// Hold each clock advance until the matching wall time has passed.
    /// `rate` is simulated seconds per wall second.
    RealTime { rate: f64 },
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::AsFastAsPossible
    }
}

impl Pacing {
    /// Real-time pacing, clamping bad rates to 1.0.
    pub fn real_time(rate: f64) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        Pacing::RealTime { rate }
    }
}

/// Configuration for creating an executive.
#[derive(Clone, Debug)]
pub struct ExecutiveConfig {
    /// Clock value at the start of every run and after `reset`.
    pub start_time: SimTime,
    pub pacing: Pacing,
    /// Fail a run that dispatches more than this many records.
    pub dispatch_limit: Option<u64>,
}

impl Default for ExecutiveConfig {
    fn default() -> Self {
        Self {
            start_time: SimTime::ZERO,
            pacing: Pacing::AsFastAsPossible,
            dispatch_limit: None,
        }
    }
}

impl ExecutiveConfig {
    pub fn with_start_time(mut self, start_time: SimTime) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_dispatch_limit(mut self, limit: u64) -> Self {
        self.dispatch_limit = Some(limit);
        self
    }
}
