//! In-memory queue for testing and single-process hosts.
//!
//! Only unacknowledged messages are kept. Each tracks its delivery count and
//! when it next becomes visible, so `nack` with a delay behaves like a real
//! visibility timeout against the configured [`Clock`]. Acknowledged
//! messages are dropped and only counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};

use super::{Delivery, Publisher, QueueError, QueueMessage, Subscriber};
use crate::clock::{Clock, SystemClock};

const DEFAULT_RETRY_DELAY_SECONDS: u32 = 30;

struct Entry {
    message: QueueMessage,
    attempts: u32,
    visible_at: DateTime<Utc>,
    in_flight: bool,
}

#[derive(Default)]
struct State {
    entries: VecDeque<Entry>,
    published: usize,
    acknowledged: usize,
}

impl State {
    fn position(&self, message_id: &str) -> Result<usize, QueueError> {
        self.entries
            .iter()
            .position(|e| e.message.id == message_id)
            .ok_or_else(|| QueueError::UnknownMessage(message_id.to_string()))
    }
}

/// Thread-safe queue; clones share the same state.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    rejecting: Arc<AtomicBool>,
    default_retry_delay: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            rejecting: Arc::new(AtomicBool::new(false)),
            default_retry_delay: DEFAULT_RETRY_DELAY_SECONDS,
        }
    }

    /// Delay applied by `nack(_, None)`.
    pub fn with_default_retry_delay(mut self, seconds: u32) -> Self {
        self.default_retry_delay = seconds;
        self
    }

    /// While set, every `publish_batch` fails with [`QueueError::Rejected`].
    pub fn reject_publishes(&self, reject: bool) {
        self.rejecting.store(reject, Ordering::SeqCst);
    }

    /// Unacknowledged messages, in publish order.
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.lock()
            .map(|state| state.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Total number of messages ever published.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.published).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.lock()
            .map(|state| state.entries.len())
            .unwrap_or_default()
    }

    /// Number of messages acknowledged so far.
    pub fn acknowledged(&self) -> usize {
        self.lock()
            .map(|state| state.acknowledged)
            .unwrap_or_default()
    }

    /// When the message next becomes visible, if it is still pending.
    pub fn visible_at(&self, message_id: &str) -> Option<DateTime<Utc>> {
        let state = self.lock().ok()?;
        state
            .entries
            .iter()
            .find(|e| e.message.id == message_id)
            .map(|e| e.visible_at)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }
}

impl Publisher for InMemoryQueue {
    fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected(format!(
                "{} message(s) refused",
                messages.len()
            )));
        }

        let now = self.clock.now();
        let mut state = self.lock()?;
        state.published += messages.len();
        state.entries.extend(messages.into_iter().map(|message| Entry {
            visible_at: now + Duration::seconds(i64::from(message.delay_seconds.unwrap_or(0))),
            message,
            attempts: 0,
            in_flight: false,
        }));
        Ok(())
    }
}

impl Subscriber for InMemoryQueue {
    fn poll(&self, timeout_ms: u64) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + StdDuration::from_millis(timeout_ms);

        loop {
            {
                let now = self.clock.now();
                let mut state = self.lock()?;
                if let Some(entry) = state
                    .entries
                    .iter_mut()
                    .find(|e| !e.in_flight && e.visible_at <= now)
                {
                    entry.in_flight = true;
                    entry.attempts += 1;
                    return Ok(Some(Delivery {
                        message: entry.message.clone(),
                        attempts: entry.attempts,
                    }));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            std::thread::sleep(StdDuration::from_millis(1));
        }
    }

    fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let position = state.position(message_id)?;
        state.entries.remove(position);
        state.acknowledged += 1;
        Ok(())
    }

    fn nack(&self, message_id: &str, delay_seconds: Option<u32>) -> Result<(), QueueError> {
        let delay = delay_seconds.unwrap_or(self.default_retry_delay);
        let visible_at = self.clock.now() + Duration::seconds(i64::from(delay));
        let mut state = self.lock()?;
        let position = state.position(message_id)?;
        let entry = &mut state.entries[position];
        entry.in_flight = false;
        entry.visible_at = visible_at;
        Ok(())
    }
}
