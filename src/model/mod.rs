//! Entities and their pure state transitions.
//!
//! Nothing in here performs I/O. Transitions take a value and return the
//! next value; persisting it is the caller's job.

mod dispatch;
mod event;
mod id;

pub use dispatch::{
    Dispatch, DispatchOutcome, DispatchStatus, Execution, ExecutionResult, NewDispatch,
    ResultStatus, TransitionError,
};
pub use event::{Event, EventWithDispatches};
pub use id::{DispatchId, EventId};
