//! In-memory reference store.
//!
//! Committed state lives behind one `RwLock`. Each unit of work buffers its
//! writes locally and merges them under the write lock only on success, so
//! readers never observe partial work. Rows get their listing position from
//! a sequence bumped under that same write lock, so pagination follows commit
//! order. Per-dispatch locks come from a [`KeyedLocks`] table shared by every
//! handle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use super::{
    ContinuationToken, Cursor, DispatchFilter, EventFilter, ListOptions, LockedDispatch, Page,
    ReadStore, RepositoryError, SortOrder, Transact, Transaction,
};
use crate::clock::{Clock, SystemClock};
use crate::lock::{KeyedLockGuard, KeyedLocks};
use crate::model::{Dispatch, DispatchId, Event, EventId, EventWithDispatches, NewDispatch};

type SortKey = (u64, Uuid);

#[derive(Default)]
struct Tables {
    next_seq: u64,
    events: HashMap<EventId, Event>,
    event_order: BTreeSet<SortKey>,
    dispatches: HashMap<DispatchId, Dispatch>,
    dispatch_order: BTreeSet<SortKey>,
    dispatches_by_event: HashMap<EventId, Vec<DispatchId>>,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert_event(&mut self, event: Event) {
        let seq = self.next_seq();
        self.event_order.insert((seq, event.id.0));
        self.events.insert(event.id, event);
    }

    fn insert_dispatch(&mut self, dispatch: Dispatch) {
        let id = dispatch.id();
        if !self.dispatches.contains_key(&id) {
            let seq = self.next_seq();
            self.dispatch_order.insert((seq, id.0));
            self.dispatches_by_event
                .entry(dispatch.event_id())
                .or_default()
                .push(id);
        }
        self.dispatches.insert(id, dispatch);
    }

    fn with_dispatches(&self, event: &Event) -> EventWithDispatches {
        let mut dispatches: Vec<Dispatch> = self
            .dispatches_by_event
            .get(&event.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.dispatches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        dispatches.sort_by_key(|d| (d.created_at(), d.id()));
        EventWithDispatches {
            event: event.clone(),
            dispatches,
        }
    }
}

/// Walk `order` from the cursor in the requested direction, keeping items
/// accepted by `pick` until the page is full, then peek for one more.
fn paginate<'a, T, F>(
    order: &'a BTreeSet<SortKey>,
    options: &ListOptions,
    mut pick: F,
) -> Result<Page<T>, RepositoryError>
where
    F: FnMut(&SortKey) -> Option<T>,
{
    let cursor = options.cursor()?;
    let max_items = options.max_items.max(1);
    let keys: Box<dyn Iterator<Item = &'a SortKey> + 'a> = match (options.order, cursor) {
        (SortOrder::Asc, None) => Box::new(order.iter()),
        (SortOrder::Asc, Some(c)) => {
            Box::new(order.range((Bound::Excluded(c.key()), Bound::Unbounded)))
        }
        (SortOrder::Desc, None) => Box::new(order.iter().rev()),
        (SortOrder::Desc, Some(c)) => Box::new(
            order
                .range((Bound::Unbounded, Bound::Excluded(c.key())))
                .rev(),
        ),
    };

    let mut items = Vec::new();
    let mut last: Option<SortKey> = None;
    let mut more = false;

    for key in keys {
        if items.len() >= max_items {
            if pick(key).is_some() {
                more = true;
                break;
            }
            continue;
        }
        if let Some(item) = pick(key) {
            items.push(item);
            last = Some(*key);
        }
    }

    let continuation = match (more, last) {
        (true, Some((seq, id))) => Some(ContinuationToken::encode(&Cursor {
            order: options.order,
            seq,
            id,
        })),
        _ => None,
    };

    Ok(Page {
        items,
        continuation,
    })
}

/// Shared in-memory store. Clones are handles onto the same state.
#[derive(Clone)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<KeyedLocks<DispatchId>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryRepository {
            tables: Arc::new(RwLock::new(Tables::default())),
            locks: Arc::new(KeyedLocks::new()),
            clock,
        }
    }

    /// Number of per-dispatch locks currently held or awaited.
    pub fn tracked_locks(&self) -> usize {
        self.locks.tracked()
    }
}

impl Transact for InMemoryRepository {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tx = InMemoryTransaction::new(self);
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(&mut tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit()?;
                Ok(value)
            }
            Ok(Err(err)) => {
                tracing::debug!("unit of work failed; discarding buffered writes");
                Err(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "unit of work panicked; discarding buffered writes");
                Err(RepositoryError::Internal(format!("unit of work panicked: {message}")).into())
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl ReadStore for InMemoryRepository {
    fn get_event(&self, id: EventId) -> Result<Option<EventWithDispatches>, RepositoryError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?;
        let event = tables.events.get(&id);
        Ok(event.map(|event| tables.with_dispatches(event)))
    }

    fn get_dispatch(&self, id: DispatchId) -> Result<Option<Dispatch>, RepositoryError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?;
        Ok(tables.dispatches.get(&id).cloned())
    }

    fn list_dispatches(
        &self,
        filter: &DispatchFilter,
        options: &ListOptions,
    ) -> Result<Page<Dispatch>, RepositoryError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?;
        paginate(&tables.dispatch_order, options, |(_, id)| {
            tables
                .dispatches
                .get(&DispatchId(*id))
                .filter(|dispatch| filter.matches(dispatch))
                .cloned()
        })
    }

    fn list_events(
        &self,
        filter: &EventFilter,
        options: &ListOptions,
    ) -> Result<Page<EventWithDispatches>, RepositoryError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?;
        paginate(&tables.event_order, options, |(_, id)| {
            tables
                .events
                .get(&EventId(*id))
                .filter(|event| filter.matches(event.created_at))
                .map(|event| tables.with_dispatches(event))
        })
    }
}

/// Write buffer plus the per-dispatch locks taken so far.
struct InMemoryTransaction<'a> {
    repo: &'a InMemoryRepository,
    events: Vec<Event>,
    dispatches: Vec<Dispatch>,
    saved: HashMap<DispatchId, Dispatch>,
    held: HashSet<DispatchId>,
    guards: Vec<KeyedLockGuard<'a, DispatchId>>,
}

impl<'a> InMemoryTransaction<'a> {
    fn new(repo: &'a InMemoryRepository) -> Self {
        Self {
            repo,
            events: Vec::new(),
            dispatches: Vec::new(),
            saved: HashMap::new(),
            held: HashSet::new(),
            guards: Vec::new(),
        }
    }

    fn buffered_event(&self, id: EventId) -> Option<&Event> {
        self.events.iter().find(|event| event.id == id)
    }

    fn buffered_dispatch(&self, id: DispatchId) -> Option<&Dispatch> {
        self.saved
            .get(&id)
            .or_else(|| self.dispatches.iter().find(|d| d.id() == id))
    }

    /// Merge the buffers into committed state, then release locks.
    fn commit(self) -> Result<(), RepositoryError> {
        if self.events.is_empty() && self.dispatches.is_empty() && self.saved.is_empty() {
            return Ok(());
        }

        let mut tables = self
            .repo
            .tables
            .write()
            .map_err(|_| RepositoryError::LockPoisoned("commit"))?;

        for event in self.events {
            tables.insert_event(event);
        }
        for dispatch in self.dispatches {
            tables.insert_dispatch(dispatch);
        }
        for (_, dispatch) in self.saved {
            tables.insert_dispatch(dispatch);
        }

        drop(tables);
        drop(self.guards);
        Ok(())
    }
}

impl Transaction for InMemoryTransaction<'_> {
    fn create_events(&mut self, payloads: Vec<Value>) -> Result<Vec<Event>, RepositoryError> {
        let created: Vec<Event> = payloads
            .into_iter()
            .map(|payload| Event {
                id: EventId::new(),
                payload,
                created_at: self.repo.clock.now(),
            })
            .collect();
        self.events.extend(created.iter().cloned());
        Ok(created)
    }

    fn create_dispatches(
        &mut self,
        dispatches: Vec<NewDispatch>,
    ) -> Result<Vec<Dispatch>, RepositoryError> {
        {
            let tables = self
                .repo
                .tables
                .read()
                .map_err(|_| RepositoryError::LockPoisoned("read"))?;
            for new in &dispatches {
                let exists = tables.events.contains_key(&new.event_id)
                    || self.buffered_event(new.event_id).is_some();
                if !exists {
                    return Err(RepositoryError::EventNotFound(new.event_id));
                }
            }
        }

        let created: Vec<Dispatch> = dispatches
            .into_iter()
            .map(|new| Dispatch::create(DispatchId::new(), self.repo.clock.now(), new))
            .collect();
        self.dispatches.extend(created.iter().cloned());
        Ok(created)
    }

    fn save_dispatch(&mut self, dispatch: Dispatch) -> Result<(), RepositoryError> {
        let id = dispatch.id();
        if let Some(pending) = self.dispatches.iter_mut().find(|d| d.id() == id) {
            *pending = dispatch;
            return Ok(());
        }

        let committed = self
            .repo
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?
            .dispatches
            .contains_key(&id);
        if !committed {
            return Err(RepositoryError::DispatchNotFound(id));
        }

        self.saved.insert(id, dispatch);
        Ok(())
    }

    fn lock_dispatch(&mut self, id: DispatchId) -> Result<Option<LockedDispatch>, RepositoryError> {
        if !self.held.contains(&id) {
            let repo = self.repo;
            let guard = repo.locks.acquire(id)?;
            self.guards.push(guard);
            self.held.insert(id);
        }

        if let Some(dispatch) = self.buffered_dispatch(id).cloned() {
            let tables = self
                .repo
                .tables
                .read()
                .map_err(|_| RepositoryError::LockPoisoned("read"))?;
            let event = self
                .buffered_event(dispatch.event_id())
                .or_else(|| tables.events.get(&dispatch.event_id()))
                .cloned()
                .ok_or(RepositoryError::EventNotFound(dispatch.event_id()))?;
            return Ok(Some(LockedDispatch { dispatch, event }));
        }

        let tables = self
            .repo
            .tables
            .read()
            .map_err(|_| RepositoryError::LockPoisoned("read"))?;
        let Some(dispatch) = tables.dispatches.get(&id).cloned() else {
            return Ok(None);
        };
        let event = tables
            .events
            .get(&dispatch.event_id())
            .cloned()
            .ok_or(RepositoryError::EventNotFound(dispatch.event_id()))?;
        Ok(Some(LockedDispatch { dispatch, event }))
    }
}
