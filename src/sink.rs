//! Event ingestion, manual retries and lost-dispatch marking.
//!
//! Every write path runs inside one repository unit of work. Enqueueing
//! happens inside that unit of work too, so a rejected batch rolls back the
//! events and dispatches it was meant to announce.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::{HubConfig, DEFAULT_LOST_THRESHOLD_SECONDS};
use crate::error::HubError;
use crate::model::{Dispatch, DispatchId, EventId, EventWithDispatches, NewDispatch};
use crate::queue::{DispatchMessage, Publisher, QueueMessage};
use crate::repository::{
    ContinuationToken, DispatchFilter, EventFilter, ListOptions, Page, Repository,
    RepositoryError, DEFAULT_PAGE_SIZE,
};
use crate::retry::RetryPolicy;
use crate::routing::RoutingConfig;

/// Parameters a retry may change. Unset fields copy the original dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryOverrides {
    pub delay_seconds: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<RetryPolicy>,
}

/// Dispatches moved to `lost` from one page, plus the token of that page.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkLostResult {
    pub dispatches: Vec<Dispatch>,
    pub continuation: Option<ContinuationToken>,
}

/// Whether `dispatch` has been idle for at least its delay plus `threshold`.
pub fn is_stale(dispatch: &Dispatch, now: DateTime<Utc>, threshold_seconds: u64) -> bool {
    let allowance = i64::from(dispatch.delay_seconds().unwrap_or(0))
        .saturating_add(i64::try_from(threshold_seconds).unwrap_or(i64::MAX));
    let idle = now - dispatch.last_activity();
    idle >= Duration::try_seconds(allowance).unwrap_or(Duration::MAX)
}

fn enqueue_all<P: Publisher + ?Sized>(
    publisher: &P,
    dispatches: &[Dispatch],
) -> Result<(), HubError> {
    if dispatches.is_empty() {
        return Ok(());
    }
    let messages = dispatches
        .iter()
        .map(|d| QueueMessage::encode(&DispatchMessage::for_dispatch(d), d.delay_seconds()))
        .collect::<Result<Vec<_>, _>>()?;
    publisher.publish_batch(messages)?;
    Ok(())
}

/// Inbound surface of the hub.
pub struct EventSink<R, P> {
    repo: R,
    publisher: P,
    routing: RoutingConfig,
    clock: Arc<dyn Clock>,
    lost_threshold_seconds: u64,
}

impl<R, P> EventSink<R, P>
where
    R: Repository,
    P: Publisher,
{
    pub fn new(repo: R, publisher: P, routing: RoutingConfig) -> Self {
        Self {
            repo,
            publisher,
            routing,
            clock: Arc::new(SystemClock),
            lost_threshold_seconds: DEFAULT_LOST_THRESHOLD_SECONDS,
        }
    }

    /// Build from a validated config.
    pub fn from_config(repo: R, publisher: P, config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self::new(repo, publisher, config.routing)
            .with_lost_threshold(config.lost_threshold_seconds))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Default idle allowance used by [`mark_lost_dispatches`](Self::mark_lost_dispatches).
    pub fn with_lost_threshold(mut self, seconds: u64) -> Self {
        self.lost_threshold_seconds = seconds;
        self
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Persist one event per payload, fan each out to its matching routes and
    /// enqueue one message per dispatch, all or nothing.
    pub fn put_event(&self, payloads: Vec<Value>) -> Result<Vec<EventWithDispatches>, HubError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.repo.transaction(|tx| -> Result<_, HubError> {
            let events = tx.create_events(payloads)?;

            let planned: Vec<NewDispatch> = events
                .iter()
                .flat_map(|event| {
                    self.routing
                        .route(&event.payload)
                        .into_iter()
                        .map(|template| template.for_event(event.id))
                })
                .collect();
            let dispatches = tx.create_dispatches(planned)?;

            enqueue_all(&self.publisher, &dispatches)?;

            Ok(events
                .into_iter()
                .map(|event| {
                    let owned = dispatches
                        .iter()
                        .filter(|d| d.event_id() == event.id)
                        .cloned()
                        .collect();
                    EventWithDispatches {
                        event,
                        dispatches: owned,
                    }
                })
                .collect::<Vec<_>>())
        });

        match &result {
            Ok(created) => {
                for entry in created {
                    tracing::info!(
                        event_id = %entry.event.id,
                        dispatches = entry.dispatches.len(),
                        "event ingested"
                    );
                }
            }
            Err(err) => tracing::warn!(error = %err, "event ingestion rolled back"),
        }

        result
    }

    /// Create and enqueue a fresh dispatch copying a resolved one. The
    /// original is left untouched.
    pub fn retry_dispatch(
        &self,
        id: DispatchId,
        overrides: RetryOverrides,
    ) -> Result<Dispatch, HubError> {
        let result = self.repo.transaction(|tx| -> Result<_, HubError> {
            let original = tx
                .lock_dispatch(id)?
                .ok_or(HubError::DispatchNotFound(id))?
                .dispatch;
            if original.is_ongoing() {
                return Err(HubError::DispatchOngoing(id));
            }

            let retry = NewDispatch {
                event_id: original.event_id(),
                destination: original.destination().to_string(),
                delay_seconds: overrides.delay_seconds.or(original.delay_seconds()),
                max_retries: overrides.max_retries.unwrap_or(original.max_retries()),
                retry_delay: overrides.retry_delay.or(original.retry_delay().copied()),
            };
            let created = tx.create_dispatches(vec![retry])?;
            enqueue_all(&self.publisher, &created)?;

            created
                .into_iter()
                .next()
                .ok_or_else(|| HubError::DispatchNotFound(id))
        });

        if let Ok(dispatch) = &result {
            tracing::info!(
                original = %id,
                dispatch_id = %dispatch.id(),
                destination = dispatch.destination(),
                "dispatch retried"
            );
        }

        result
    }

    /// Read one page of ongoing dispatches, oldest first, and mark each stale
    /// one lost in its own unit of work.
    ///
    /// The returned token is the page's token, so it is present whenever more
    /// ongoing dispatches remain even if none on this page went stale.
    pub fn mark_lost_dispatches(
        &self,
        max_items: Option<usize>,
        threshold_seconds: Option<u64>,
        continuation: Option<ContinuationToken>,
    ) -> Result<MarkLostResult, HubError> {
        let threshold = threshold_seconds.unwrap_or(self.lost_threshold_seconds);
        let options = ListOptions::new(max_items.unwrap_or(DEFAULT_PAGE_SIZE)).after(continuation);
        let page = self.repo.list_dispatches(&DispatchFilter::ongoing(), &options)?;

        let now = self.clock.now();
        let mut lost = Vec::new();
        for candidate in page.items {
            if !is_stale(&candidate, now, threshold) {
                continue;
            }
            match self.mark_lost(candidate.id(), now, threshold) {
                Ok(Some(dispatch)) => {
                    tracing::info!(
                        dispatch_id = %dispatch.id(),
                        destination = dispatch.destination(),
                        "dispatch marked lost"
                    );
                    lost.push(dispatch);
                }
                Ok(None) => {}
                Err(err) => tracing::error!(
                    dispatch_id = %candidate.id(),
                    error = %err,
                    "failed to mark dispatch lost"
                ),
            }
        }

        Ok(MarkLostResult {
            dispatches: lost,
            continuation: page.continuation,
        })
    }

    // Staleness is checked again under the lock; an execution may have landed
    // since the page was read.
    fn mark_lost(
        &self,
        id: DispatchId,
        now: DateTime<Utc>,
        threshold: u64,
    ) -> Result<Option<Dispatch>, HubError> {
        self.repo.transaction(|tx| -> Result<_, HubError> {
            let Some(locked) = tx.lock_dispatch(id)? else {
                return Ok(None);
            };
            let dispatch = locked.dispatch;
            if !dispatch.is_ongoing() || !is_stale(&dispatch, now, threshold) {
                return Ok(None);
            }

            let lost = dispatch
                .mark_lost(now)
                .map_err(|err| RepositoryError::Internal(err.to_string()))?;
            tx.save_dispatch(lost.clone())?;
            Ok(Some(lost))
        })
    }

    pub fn get_event(&self, id: EventId) -> Result<Option<EventWithDispatches>, HubError> {
        Ok(self.repo.get_event(id)?)
    }

    pub fn get_dispatch(&self, id: DispatchId) -> Result<Option<Dispatch>, HubError> {
        Ok(self.repo.get_dispatch(id)?)
    }

    pub fn list_dispatches(
        &self,
        filter: &DispatchFilter,
        options: &ListOptions,
    ) -> Result<Page<Dispatch>, HubError> {
        Ok(self.repo.list_dispatches(filter, options)?)
    }

    pub fn list_events(
        &self,
        filter: &EventFilter,
        options: &ListOptions,
    ) -> Result<Page<EventWithDispatches>, HubError> {
        Ok(self.repo.list_events(filter, options)?)
    }
}
