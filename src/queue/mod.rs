//! Queue boundary: the messages the engine enqueues and the primitives it
//! needs back from whichever at-least-once queue carries them.
//!
//! ```text
//!   EventSink ──publish_batch──▶ [ queue ] ──poll──▶ DispatchWorker
//!                                    ▲                    │
//!                                    └──── ack / nack ────┘
//! ```

mod in_memory;
mod message;

pub use in_memory::InMemoryQueue;
pub use message::{Delivery, DispatchMessage, QueueMessage, BITCODE_CONTENT_TYPE};

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode queue message: {0}")]
    Encode(String),
    #[error("failed to decode queue message: {0}")]
    Decode(String),
    #[error("queue rejected the batch: {0}")]
    Rejected(String),
    #[error("unknown queue message {0}")]
    UnknownMessage(String),
    #[error("queue state poisoned")]
    Poisoned,
}

/// Producer side of the queue.
pub trait Publisher: Send + Sync {
    /// Enqueue every message or none of them.
    fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError>;
}

/// Consumer side of the queue. Pull-based, one message at a time.
pub trait Subscriber: Send + Sync {
    /// Next visible message, waiting up to `timeout_ms`.
    fn poll(&self, timeout_ms: u64) -> Result<Option<Delivery>, QueueError>;

    /// Remove a message; it will not be redelivered.
    fn ack(&self, message_id: &str) -> Result<(), QueueError>;

    /// Return a message for redelivery after `delay_seconds`, or the queue's
    /// default delay when `None`.
    fn nack(&self, message_id: &str, delay_seconds: Option<u32>) -> Result<(), QueueError>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        (**self).publish_batch(messages)
    }
}

impl<S: Subscriber + ?Sized> Subscriber for Arc<S> {
    fn poll(&self, timeout_ms: u64) -> Result<Option<Delivery>, QueueError> {
        (**self).poll(timeout_ms)
    }

    fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        (**self).ack(message_id)
    }

    fn nack(&self, message_id: &str, delay_seconds: Option<u32>) -> Result<(), QueueError> {
        (**self).nack(message_id, delay_seconds)
    }
}
