//! Per-key mutual exclusion for the in-memory store.
//!
//! [`KeyedLocks`] tracks which keys are held in one table guarded by a single
//! mutex. Waiters park on a shared condvar and entries disappear once a key is
//! neither held nor awaited.

mod error;
mod keyed;

pub use error::LockError;
pub use keyed::{KeyedLockGuard, KeyedLocks};
