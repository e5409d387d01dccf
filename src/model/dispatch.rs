use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DispatchId, EventId};
use crate::retry::RetryPolicy;

/// Outcome recorded for one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionResult {
    Complete,
    Ignored,
    Failed,
    Misconfigured,
}

/// One immutable entry of a dispatch's execution log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub result: ExecutionResult,
    pub executed_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(result: ExecutionResult, executed_at: DateTime<Utc>) -> Self {
        Self {
            result,
            executed_at,
        }
    }
}

/// Terminal status of a resolved dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Complete,
    Ignored,
    Failed,
    Misconfigured,
    Lost,
}

impl From<ExecutionResult> for ResultStatus {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Complete => ResultStatus::Complete,
            ExecutionResult::Ignored => ResultStatus::Ignored,
            ExecutionResult::Failed => ResultStatus::Failed,
            ExecutionResult::Misconfigured => ResultStatus::Misconfigured,
        }
    }
}

/// Lifecycle of a dispatch. A resolved dispatch always knows when it resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DispatchStatus {
    Ongoing,
    #[serde(rename_all = "camelCase")]
    Resulted {
        status: ResultStatus,
        resulted_at: DateTime<Utc>,
    },
}

impl DispatchStatus {
    pub fn is_ongoing(&self) -> bool {
        matches!(self, DispatchStatus::Ongoing)
    }

    /// The terminal status, if resolved.
    pub fn result(&self) -> Option<ResultStatus> {
        match self {
            DispatchStatus::Ongoing => None,
            DispatchStatus::Resulted { status, .. } => Some(*status),
        }
    }
}

/// What a single call into the dispatcher produced.
///
/// `NotFound` is never recorded: it means the dispatch was missing or
/// already resolved, so the message is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Complete,
    Ignored,
    Failed,
    Misconfigured,
    NotFound,
}

impl DispatchOutcome {
    /// Whether the queue message should be acknowledged rather than
    /// redelivered.
    pub fn should_ack(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed)
    }
}

impl From<ExecutionResult> for DispatchOutcome {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Complete => DispatchOutcome::Complete,
            ExecutionResult::Ignored => DispatchOutcome::Ignored,
            ExecutionResult::Failed => DispatchOutcome::Failed,
            ExecutionResult::Misconfigured => DispatchOutcome::Misconfigured,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("dispatch {0} is already resolved")]
    NotOngoing(DispatchId),
    #[error("dispatch {0} has a status its execution log does not produce")]
    Inconsistent(DispatchId),
}

/// Parameters for a dispatch that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDispatch {
    pub event_id: EventId,
    pub destination: String,
    pub delay_seconds: Option<u32>,
    pub max_retries: u32,
    pub retry_delay: Option<RetryPolicy>,
}

/// One intended delivery of one event to one destination.
///
/// Deserializing replays the execution log, so only states reachable through
/// [`append_execution`](Self::append_execution) and
/// [`mark_lost`](Self::mark_lost) are accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "StoredDispatch")]
pub struct Dispatch {
    id: DispatchId,
    event_id: EventId,
    destination: String,
    created_at: DateTime<Utc>,
    delay_seconds: Option<u32>,
    max_retries: u32,
    retry_delay: Option<RetryPolicy>,
    execution_log: Vec<Execution>,
    status: DispatchStatus,
}

impl Dispatch {
    /// A fresh, ongoing dispatch with an empty execution log.
    pub fn create(id: DispatchId, created_at: DateTime<Utc>, new: NewDispatch) -> Self {
        Self {
            id,
            event_id: new.event_id,
            destination: new.destination,
            created_at,
            delay_seconds: new.delay_seconds,
            max_retries: new.max_retries,
            retry_delay: new.retry_delay,
            execution_log: Vec::new(),
            status: DispatchStatus::Ongoing,
        }
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn delay_seconds(&self) -> Option<u32> {
        self.delay_seconds
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Option<&RetryPolicy> {
        self.retry_delay.as_ref()
    }

    pub fn execution_log(&self) -> &[Execution] {
        &self.execution_log
    }

    pub fn status(&self) -> DispatchStatus {
        self.status
    }

    pub fn is_ongoing(&self) -> bool {
        self.status.is_ongoing()
    }

    /// Timestamp of the latest execution, or creation time if never executed.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.execution_log
            .last()
            .map(|execution| execution.executed_at)
            .unwrap_or(self.created_at)
    }

    /// Record an attempt and derive the next status.
    ///
    /// Non-failed results resolve immediately. A failure resolves only once
    /// the log holds more entries than `max_retries`.
    pub fn append_execution(mut self, execution: Execution) -> Result<Self, TransitionError> {
        if !self.is_ongoing() {
            return Err(TransitionError::NotOngoing(self.id));
        }

        self.execution_log.push(execution);

        let exhausted = self.execution_log.len() > self.max_retries as usize;
        self.status = match execution.result {
            ExecutionResult::Failed if !exhausted => DispatchStatus::Ongoing,
            result => DispatchStatus::Resulted {
                status: result.into(),
                resulted_at: execution.executed_at,
            },
        };

        Ok(self)
    }

    /// Resolve a stalled dispatch as lost. The execution log is untouched.
    pub fn mark_lost(mut self, resulted_at: DateTime<Utc>) -> Result<Self, TransitionError> {
        if !self.is_ongoing() {
            return Err(TransitionError::NotOngoing(self.id));
        }

        self.status = DispatchStatus::Resulted {
            status: ResultStatus::Lost,
            resulted_at,
        };

        Ok(self)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDispatch {
    id: DispatchId,
    event_id: EventId,
    destination: String,
    created_at: DateTime<Utc>,
    delay_seconds: Option<u32>,
    max_retries: u32,
    retry_delay: Option<RetryPolicy>,
    execution_log: Vec<Execution>,
    status: DispatchStatus,
}

impl TryFrom<StoredDispatch> for Dispatch {
    type Error = TransitionError;

    fn try_from(stored: StoredDispatch) -> Result<Self, Self::Error> {
        let id = stored.id;
        let fresh = Dispatch::create(
            id,
            stored.created_at,
            NewDispatch {
                event_id: stored.event_id,
                destination: stored.destination,
                delay_seconds: stored.delay_seconds,
                max_retries: stored.max_retries,
                retry_delay: stored.retry_delay,
            },
        );
        let mut replayed = stored
            .execution_log
            .into_iter()
            .try_fold(fresh, Dispatch::append_execution)
            .map_err(|_| TransitionError::Inconsistent(id))?;

        if let DispatchStatus::Resulted {
            status: ResultStatus::Lost,
            resulted_at,
        } = stored.status
        {
            replayed = replayed
                .mark_lost(resulted_at)
                .map_err(|_| TransitionError::Inconsistent(id))?;
        }

        if replayed.status != stored.status {
            return Err(TransitionError::Inconsistent(id));
        }
        Ok(replayed)
    }
}
