//! Shared fixtures: a hub wired over in-memory storage, an in-memory queue
//! and a manual clock, plus handlers that record what they were given.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};

use dispatch_hub::repository::LockedDispatch;
use dispatch_hub::{
    Clock, Dispatch, DispatchFilter, DispatchId, DispatchWorker, Dispatcher, Event, EventFilter,
    EventId, EventSink, EventWithDispatches, HandlerError, HandlerOutcome, HandlerRegistry,
    InMemoryQueue, InMemoryRepository, ListOptions, ManualClock, NewDispatch, Page, ReadStore,
    RepositoryError, RoutingConfig, Transact, Transaction,
};
use serde_json::Value;

pub type Sink = EventSink<InMemoryRepository, InMemoryQueue>;
pub type Worker = DispatchWorker<InMemoryRepository, HandlerRegistry, InMemoryQueue>;

static TRACING: Once = Once::new();

/// Route engine logs to the test harness; `RUST_LOG=dispatch_hub=debug` to see them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Hub {
    pub clock: ManualClock,
    pub repo: InMemoryRepository,
    pub queue: InMemoryQueue,
    pub sink: Arc<Sink>,
    pub worker: Worker,
}

impl Hub {
    pub fn new(routing: RoutingConfig, handlers: HandlerRegistry) -> Self {
        init_tracing();

        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let repo = InMemoryRepository::with_clock(shared.clone());
        let queue = InMemoryQueue::with_clock(shared.clone());

        let sink = Arc::new(
            EventSink::new(repo.clone(), queue.clone(), routing).with_clock(shared.clone()),
        );
        let dispatcher = Dispatcher::new(repo.clone(), handlers).with_clock(shared);
        let worker = DispatchWorker::new(dispatcher, queue.clone());

        Self {
            clock,
            repo,
            queue,
            sink,
            worker,
        }
    }
}

/// A handler that replays scripted outcomes and records every payload.
///
/// `Err` entries become handler faults. Once the script runs out the last
/// entry repeats.
#[derive(Clone)]
pub struct Scripted {
    script: Arc<Mutex<VecDeque<Result<HandlerOutcome, String>>>>,
    last: Arc<Mutex<Result<HandlerOutcome, String>>>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Scripted {
    pub fn new(script: Vec<Result<HandlerOutcome, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            last: Arc::new(Mutex::new(Ok(HandlerOutcome::Complete))),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(outcome: HandlerOutcome) -> Self {
        Self::new(vec![Ok(outcome)])
    }

    pub fn failing() -> Self {
        Self::new(vec![Err("destination unavailable".to_string())])
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }

    /// A registrable handler function sharing this script.
    pub fn handler(
        &self,
    ) -> impl Fn(&Value) -> Result<HandlerOutcome, HandlerError> + Send + Sync {
        let this = self.clone();
        move |payload: &Value| {
            this.seen.lock().unwrap().push(payload.clone());
            let next = this.script.lock().unwrap().pop_front();
            let step = match next {
                Some(step) => {
                    *this.last.lock().unwrap() = step.clone();
                    step
                }
                None => this.last.lock().unwrap().clone(),
            };
            step.map_err(HandlerError::from)
        }
    }
}

/// Storage over an [`InMemoryRepository`] whose writes to chosen dispatches
/// fail, the way a backend outage would surface.
#[derive(Clone)]
pub struct FaultyRepository {
    inner: InMemoryRepository,
    failing: Arc<Mutex<HashSet<DispatchId>>>,
}

impl FaultyRepository {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            failing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Every later `save_dispatch` of `id` fails.
    pub fn fail_saves_of(&self, id: DispatchId) {
        self.failing.lock().unwrap().insert(id);
    }
}

struct FaultyTransaction<'a> {
    inner: &'a mut dyn Transaction,
    failing: &'a HashSet<DispatchId>,
}

impl Transaction for FaultyTransaction<'_> {
    fn create_events(&mut self, payloads: Vec<Value>) -> Result<Vec<Event>, RepositoryError> {
        self.inner.create_events(payloads)
    }

    fn create_dispatches(
        &mut self,
        dispatches: Vec<NewDispatch>,
    ) -> Result<Vec<Dispatch>, RepositoryError> {
        self.inner.create_dispatches(dispatches)
    }

    fn save_dispatch(&mut self, dispatch: Dispatch) -> Result<(), RepositoryError> {
        if self.failing.contains(&dispatch.id()) {
            return Err(RepositoryError::Internal(format!(
                "write of dispatch {} refused",
                dispatch.id()
            )));
        }
        self.inner.save_dispatch(dispatch)
    }

    fn lock_dispatch(&mut self, id: DispatchId) -> Result<Option<LockedDispatch>, RepositoryError> {
        self.inner.lock_dispatch(id)
    }
}

impl Transact for FaultyRepository {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let failing = self.failing.lock().unwrap().clone();
        self.inner.transaction(|tx| {
            let mut faulty = FaultyTransaction {
                inner: tx,
                failing: &failing,
            };
            work(&mut faulty)
        })
    }
}

impl ReadStore for FaultyRepository {
    fn get_event(&self, id: EventId) -> Result<Option<EventWithDispatches>, RepositoryError> {
        self.inner.get_event(id)
    }

    fn get_dispatch(&self, id: DispatchId) -> Result<Option<Dispatch>, RepositoryError> {
        self.inner.get_dispatch(id)
    }

    fn list_dispatches(
        &self,
        filter: &DispatchFilter,
        options: &ListOptions,
    ) -> Result<Page<Dispatch>, RepositoryError> {
        self.inner.list_dispatches(filter, options)
    }

    fn list_events(
        &self,
        filter: &EventFilter,
        options: &ListOptions,
    ) -> Result<Page<EventWithDispatches>, RepositoryError> {
        self.inner.list_events(filter, options)
    }
}
