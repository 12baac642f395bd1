//! Simulation Executive
//!
//! A deterministic discrete-event simulation executive with:
//! - A single simulated clock that only moves forward
//! - Events ordered by (time, priority descending, submission order)
//! - Synchronous, detachable (suspendable) and daemon callbacks
//! - Run lifecycle control: start, pause, resume, stop, abort, reset
//! - Optional real-time pacing (spin_sleep)

pub mod time;
pub mod error;
pub mod event;
pub mod pq;
pub mod clock;
pub mod executor;
pub mod suspend;
pub mod context;
pub mod sync;
pub mod control;
pub mod observer;
pub mod config;
pub mod executive;


pub use config::{ExecutiveConfig, Pacing};
pub use context::{DetachedContext, SuspendUntil};
pub use control::{ExecState, ExecutiveController};
pub use error::{CallbackError, CallbackResult, ExecutiveError, Result};
pub use event::{
    DetachableHandler, EventId, EventMode, EventRequest, Handler, HandlerId, Payload, PendingEvent,
    Priority, TargetId,
};
pub use executive::Executive;
pub use observer::{ExecutiveEvent, ObserverId};
pub use suspend::{SuspendStatus, Suspended, SuspensionController};
pub use sync::Rendezvous;
pub use time::SimTime;
