use thiserror::Error;

use crate::config::ConfigError;
use crate::model::DispatchId;
use crate::queue::QueueError;
use crate::repository::{PaginationError, RepositoryError};

/// Failure surfaced by the sink's inbound operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("dispatch {0} not found")]
    DispatchNotFound(DispatchId),
    #[error("dispatch {0} is still ongoing and cannot be retried")]
    DispatchOngoing(DispatchId),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl HubError {
    /// The pagination failure behind this error, if any.
    pub fn pagination(&self) -> Option<&PaginationError> {
        match self {
            HubError::Storage(RepositoryError::Pagination(err)) => Some(err),
            _ => None,
        }
    }
}

impl From<PaginationError> for HubError {
    fn from(err: PaginationError) -> Self {
        HubError::Storage(err.into())
    }
}
