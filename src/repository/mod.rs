//! Storage contract for events and dispatches.
//!
//! Two capability groups, composed into [`Repository`] the same way the rest
//! of the crate composes small traits:
//!
//! - [`Transact`]: run a unit of work against a [`Transaction`] handle. Writes
//!   become visible together when the work succeeds and not at all when it
//!   fails or faults.
//! - [`ReadStore`]: lookups and cursor-paginated listings.

mod error;
mod in_memory;
mod page;

use serde_json::Value;

pub use error::{PaginationError, RepositoryError};
pub use in_memory::InMemoryRepository;
pub(crate) use in_memory::panic_message;
pub use page::{
    ContinuationToken, Cursor, DispatchFilter, EventFilter, ListOptions, Page, SortOrder,
    StatusFilter, DEFAULT_PAGE_SIZE,
};

use crate::model::{Dispatch, DispatchId, Event, EventId, EventWithDispatches, NewDispatch};

/// A dispatch held under its per-id lock, with its owning event.
#[derive(Clone, Debug, PartialEq)]
pub struct LockedDispatch {
    pub dispatch: Dispatch,
    pub event: Event,
}

/// Mutation handle available inside a unit of work.
pub trait Transaction {
    /// Persist one event per payload, in order.
    fn create_events(&mut self, payloads: Vec<Value>) -> Result<Vec<Event>, RepositoryError>;

    /// Persist dispatches. Fails if any references an event that does not
    /// exist (committed or created earlier in this unit of work).
    fn create_dispatches(
        &mut self,
        dispatches: Vec<NewDispatch>,
    ) -> Result<Vec<Dispatch>, RepositoryError>;

    /// Overwrite an existing dispatch.
    fn save_dispatch(&mut self, dispatch: Dispatch) -> Result<(), RepositoryError>;

    /// Lock `id` for the rest of the unit of work and load it with its event.
    fn lock_dispatch(&mut self, id: DispatchId) -> Result<Option<LockedDispatch>, RepositoryError>;
}

/// Transactional mutation.
pub trait Transact {
    /// Run `work` atomically. Any `Err` from `work`, and any panic inside it,
    /// discards every write made through the handle. Locks taken through the
    /// handle are released when this returns.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<RepositoryError>;
}

/// Read access to committed state.
pub trait ReadStore {
    fn get_event(&self, id: EventId) -> Result<Option<EventWithDispatches>, RepositoryError>;

    fn get_dispatch(&self, id: DispatchId) -> Result<Option<Dispatch>, RepositoryError>;

    fn list_dispatches(
        &self,
        filter: &DispatchFilter,
        options: &ListOptions,
    ) -> Result<Page<Dispatch>, RepositoryError>;

    fn list_events(
        &self,
        filter: &EventFilter,
        options: &ListOptions,
    ) -> Result<Page<EventWithDispatches>, RepositoryError>;
}

/// Full repository combining both capability groups.
pub trait Repository: Transact + ReadStore + Send + Sync {}

impl<T> Repository for T where T: Transact + ReadStore + Send + Sync {}
