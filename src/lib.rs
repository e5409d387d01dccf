//! Event dispatch engine.
//!
//! Incoming events are routed to every destination whose condition tree
//! matches, each delivery is tracked as a [`Dispatch`] with its own retry
//! budget, and dispatches that stall are reclaimed as lost.
//!
//! ```ignore
//! use dispatch_hub::{
//!     Condition, Dispatcher, DispatchWorker, EventSink, HandlerOutcome, HandlerRegistry,
//!     InMemoryQueue, InMemoryRepository, Route, RoutingConfig,
//! };
//!
//! let repo = InMemoryRepository::new();
//! let queue = InMemoryQueue::new();
//! let routing = RoutingConfig::new(vec![
//!     Route::new(Condition::exact("$.like", "culture"), "museums").with_max_retries(3),
//! ]);
//!
//! let sink = EventSink::new(repo.clone(), queue.clone(), routing);
//! sink.put_event(vec![serde_json::json!({ "like": "culture" })])?;
//!
//! let handlers = HandlerRegistry::new()
//!     .register("museums", |_: &serde_json::Value| Ok(HandlerOutcome::Complete));
//! let worker = DispatchWorker::new(Dispatcher::new(repo, handlers), queue);
//! worker.drain(100)?;
//! ```

mod clock;
mod config;
mod dispatcher;
mod error;
mod handler;
mod scanner;
mod sink;

pub mod lock;
pub mod model;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod routing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, HubConfig, DEFAULT_LOST_SCAN_INTERVAL_SECONDS, DEFAULT_LOST_SCAN_PAGE_SIZE,
    DEFAULT_LOST_THRESHOLD_SECONDS,
};
pub use dispatcher::{
    DispatchWorker, DispatchWorkerThread, Dispatcher, DrainResult, Processed, WorkerStats,
};
pub use error::HubError;
pub use handler::{Handler, HandlerError, HandlerOutcome, HandlerRegistry, HandlerResolver};
pub use model::{
    Dispatch, DispatchId, DispatchOutcome, DispatchStatus, Event, EventId, EventWithDispatches,
    Execution, ExecutionResult, NewDispatch, ResultStatus, TransitionError,
};
pub use queue::{
    Delivery, DispatchMessage, InMemoryQueue, Publisher, QueueError, QueueMessage, Subscriber,
};
pub use repository::{
    ContinuationToken, DispatchFilter, EventFilter, InMemoryRepository, ListOptions, Page,
    PaginationError, ReadStore, Repository, RepositoryError, SortOrder, StatusFilter, Transact,
    Transaction,
};
pub use retry::{retry_delay, RetryPolicy};
pub use routing::{Condition, Operator, Route, RouteDefaults, RoutingConfig};
pub use scanner::{LostDispatchScanner, LostScannerThread, ScanReport, ScannerStats};
pub use sink::{is_stale, EventSink, MarkLostResult, RetryOverrides};
