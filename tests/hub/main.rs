//! Dispatch hub integration tests.
//!
//! Drives the whole engine through its public surface:
//! - Ingestion with fan-out and transactional enqueue
//! - Queue-driven execution, retries and idempotent redelivery
//! - Manual retries and lost-dispatch reclamation
//! - Paginated listings

mod dispatching;
mod pagination;
mod retries;
mod support;
