//! Executive errors

use crate::control::ExecState;
use crate::event::EventId;
use crate::time::SimTime;

/// Error type returned by user callbacks.
///
/// Boxed so callbacks can use `?` on any error type.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by user callbacks.
pub type CallbackResult = std::result::Result<(), CallbackError>;

pub type Result<T> = std::result::Result<T, ExecutiveError>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutiveError {
    /// A record was due before the current clock. Always fatal to the run.
    #[error("causality violation: event {event} due at {when} but clock is already at {now}")]
    CausalityViolation {
        event: EventId,
        when: SimTime,
        now: SimTime,
    },

    #[error("cannot {operation} while executive is {state}")]
    InvalidStateTransition {
        state: ExecState,
        operation: &'static str,
    },

    #[error("event queue is empty")]
    EmptyQueue,

    #[error("event {0} is already queued")]
    DuplicateEventId(EventId),

    /// A synchronous or detachable callback returned an error.
    #[error("callback for event {event} failed at {at}: {source}")]
    Callback {
        event: EventId,
        at: SimTime,
        #[source]
        source: CallbackError,
    },

    #[error("dispatch limit of {limit} events exceeded")]
    DispatchLimitExceeded { limit: u64 },
}

impl ExecutiveError {
    pub(crate) fn invalid(state: ExecState, operation: &'static str) -> Self {
        ExecutiveError::InvalidStateTransition { state, operation }
    }

    /// Whether the error was raised by user code rather than the executive.
    pub fn is_callback_error(&self) -> bool {
        matches!(self, ExecutiveError::Callback { .. })
    }
}
