use thiserror::Error;

use crate::lock::LockError;
use crate::model::{DispatchId, EventId};

/// Why a continuation token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("continuation token is malformed")]
    InvalidToken,
    #[error("continuation token was issued for {issued} order, not {requested}")]
    OrderMismatch {
        issued: &'static str,
        requested: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("event {0} does not exist")]
    EventNotFound(EventId),
    #[error("dispatch {0} does not exist")]
    DispatchNotFound(DispatchId),
    #[error(transparent)]
    Pagination(#[from] PaginationError),
    #[error("internal storage error: {0}")]
    Internal(String),
}
