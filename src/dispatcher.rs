//! Execution engine and its queue adapter.
//!
//! [`Dispatcher::dispatch`] never fails: every path resolves to one of the
//! five [`DispatchOutcome`]s. [`DispatchWorker`] turns those outcomes into
//! queue acknowledgements, and [`DispatchWorkerThread`] runs a worker in the
//! background.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::handler::{Handler, HandlerResolver};
use crate::model::{Dispatch, DispatchOutcome, Execution, ExecutionResult};
use crate::queue::{Delivery, DispatchMessage, QueueError, Subscriber};
use crate::repository::{panic_message, LockedDispatch, Repository, RepositoryError};
use crate::retry::retry_delay;

/// Runs one queued dispatch against its destination handler.
pub struct Dispatcher<R, H> {
    repo: R,
    handlers: H,
    clock: Arc<dyn Clock>,
}

impl<R, H> Dispatcher<R, H>
where
    R: Repository,
    H: HandlerResolver,
{
    pub fn new(repo: R, handlers: H) -> Self {
        Self {
            repo,
            handlers,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lock the dispatch, run its handler and record the attempt.
    ///
    /// A missing or already resolved dispatch yields `NotFound` and writes
    /// nothing, so redelivered messages are harmless. A storage fault also
    /// writes nothing and yields `Failed`, leaving the message to the queue.
    pub fn dispatch(&self, message: &DispatchMessage) -> DispatchOutcome {
        let id = message.dispatch_id;
        let result = self.repo.transaction(|tx| -> Result<_, RepositoryError> {
            let Some(LockedDispatch { dispatch, event }) = tx.lock_dispatch(id)? else {
                return Ok(DispatchOutcome::NotFound);
            };
            if !dispatch.is_ongoing() {
                return Ok(DispatchOutcome::NotFound);
            }

            let result = match self.handlers.resolve(dispatch.destination()) {
                Some(handler) => invoke(handler.as_ref(), &event.payload, &dispatch),
                None => {
                    tracing::warn!(
                        dispatch_id = %id,
                        destination = dispatch.destination(),
                        "no handler registered for destination"
                    );
                    ExecutionResult::Misconfigured
                }
            };

            let updated = dispatch
                .append_execution(Execution::new(result, self.clock.now()))
                .map_err(|err| RepositoryError::Internal(err.to_string()))?;
            let status = updated.status();
            tx.save_dispatch(updated)?;

            tracing::debug!(dispatch_id = %id, ?status, "execution recorded");
            Ok(DispatchOutcome::from(result))
        });

        match result {
            Ok(outcome) => {
                tracing::info!(dispatch_id = %id, ?outcome, "dispatch processed");
                outcome
            }
            Err(err) => {
                tracing::error!(
                    dispatch_id = %id,
                    error = %err,
                    "storage fault while dispatching; leaving message for redelivery"
                );
                DispatchOutcome::Failed
            }
        }
    }
}

// Handler errors and panics both count as a failed attempt.
fn invoke(
    handler: &dyn Handler,
    payload: &Value,
    dispatch: &Dispatch,
) -> ExecutionResult {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
        Ok(Ok(outcome)) => outcome.into(),
        Ok(Err(err)) => {
            tracing::warn!(
                dispatch_id = %dispatch.id(),
                destination = dispatch.destination(),
                error = %err,
                "handler failed"
            );
            ExecutionResult::Failed
        }
        Err(panic) => {
            tracing::error!(
                dispatch_id = %dispatch.id(),
                destination = dispatch.destination(),
                panic = %panic_message(panic.as_ref()),
                "handler panicked"
            );
            ExecutionResult::Failed
        }
    }
}

/// What the worker did with one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Processed {
    Acked(DispatchOutcome),
    /// Nacked; `delay_seconds` is `None` when the queue default applies.
    Retried { delay_seconds: Option<u32> },
    /// The body could not be decoded and the message was dropped.
    Undecodable,
}

/// Tally of a [`DispatchWorker::drain`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    pub acked: usize,
    pub retried: usize,
    pub undecodable: usize,
}

impl DrainResult {
    pub fn processed(&self) -> usize {
        self.acked + self.retried + self.undecodable
    }

    fn record(&mut self, processed: Processed) {
        match processed {
            Processed::Acked(_) => self.acked += 1,
            Processed::Retried { .. } => self.retried += 1,
            Processed::Undecodable => self.undecodable += 1,
        }
    }
}

/// Pulls messages from a queue and feeds them to a [`Dispatcher`].
pub struct DispatchWorker<R, H, S> {
    dispatcher: Dispatcher<R, H>,
    subscriber: S,
    poll_timeout_ms: u64,
}

impl<R, H, S> DispatchWorker<R, H, S>
where
    R: Repository,
    H: HandlerResolver,
    S: Subscriber,
{
    pub fn new(dispatcher: Dispatcher<R, H>, subscriber: S) -> Self {
        Self {
            dispatcher,
            subscriber,
            poll_timeout_ms: 0,
        }
    }

    /// How long `process_one` waits for a message.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<R, H> {
        &self.dispatcher
    }

    /// Poll once and handle the message if one arrived.
    pub fn process_one(&self) -> Result<Option<Processed>, QueueError> {
        match self.subscriber.poll(self.poll_timeout_ms)? {
            Some(delivery) => self.process(delivery).map(Some),
            None => Ok(None),
        }
    }

    /// Handle up to `max` messages, stopping early when the queue has none
    /// visible.
    pub fn drain(&self, max: usize) -> Result<DrainResult, QueueError> {
        let mut result = DrainResult::default();
        while result.processed() < max {
            match self.subscriber.poll(0)? {
                Some(delivery) => result.record(self.process(delivery)?),
                None => break,
            }
        }
        Ok(result)
    }

    /// Dispatch one delivery and ack or nack it.
    ///
    /// Failed outcomes are nacked with a delay from the message's retry
    /// policy; the policy sees the number of earlier deliveries.
    pub fn process(&self, delivery: Delivery) -> Result<Processed, QueueError> {
        let message_id = delivery.message.id.clone();

        let message = match delivery.message.decode() {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(
                    message_id = %message_id,
                    error = %err,
                    "dropping undecodable message"
                );
                self.subscriber.ack(&message_id)?;
                return Ok(Processed::Undecodable);
            }
        };

        let outcome = self.dispatcher.dispatch(&message);
        if outcome.should_ack() {
            self.subscriber.ack(&message_id)?;
            return Ok(Processed::Acked(outcome));
        }

        let prior_retries = delivery.attempts.saturating_sub(1);
        let delay_seconds = retry_delay(message.retry_delay.as_ref(), prior_retries);
        tracing::info!(
            dispatch_id = %message.dispatch_id,
            attempts = delivery.attempts,
            ?delay_seconds,
            "scheduling redelivery"
        );
        self.subscriber.nack(&message_id, delay_seconds)?;
        Ok(Processed::Retried { delay_seconds })
    }
}

/// Statistics from the worker thread.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub acked: usize,
    pub retried: usize,
    pub undecodable: usize,
    pub queue_errors: usize,
    pub polls: usize,
}

/// A background thread that keeps draining a queue through a
/// [`DispatchWorker`].
///
/// ```ignore
/// let worker = DispatchWorker::new(Dispatcher::new(repo, handlers), queue.clone());
/// let thread = DispatchWorkerThread::spawn(worker, Duration::from_millis(50));
///
/// // ... put events ...
///
/// let stats = thread.stop();
/// println!("acked {} messages", stats.acked);
/// ```
pub struct DispatchWorkerThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl DispatchWorkerThread {
    /// Spawn a thread that drains the queue, sleeping `poll_interval` between
    /// polls.
    pub fn spawn<R, H, S>(worker: DispatchWorker<R, H, S>, poll_interval: Duration) -> Self
    where
        R: Repository + 'static,
        H: HandlerResolver + 'static,
        S: Subscriber + 'static,
    {
        Self::spawn_with_batch(worker, poll_interval, 100)
    }

    /// Same as [`spawn`](Self::spawn), handling at most `batch` messages per
    /// poll.
    pub fn spawn_with_batch<R, H, S>(
        worker: DispatchWorker<R, H, S>,
        poll_interval: Duration,
        batch: usize,
    ) -> Self
    where
        R: Repository + 'static,
        H: HandlerResolver + 'static,
        S: Subscriber + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.polls += 1;

                match worker.drain(batch) {
                    Ok(result) => {
                        stats.acked += result.acked;
                        stats.retried += result.retried;
                        stats.undecodable += result.undecodable;
                    }
                    Err(err) => {
                        stats.queue_errors += 1;
                        tracing::error!(error = %err, "dispatch worker poll failed");
                    }
                }

                thread::sleep(poll_interval);
            }

            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> WorkerStats {
        let _ = self.stop_tx.send(());
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for DispatchWorkerThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
