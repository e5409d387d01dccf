//! Destination handlers and the registry that resolves destination keys.
//!
//! ```ignore
//! use dispatch_hub::{HandlerOutcome, HandlerRegistry};
//!
//! let handlers = HandlerRegistry::new()
//!     .register("email", |payload: &serde_json::Value| {
//!         send_email(payload)?;
//!         Ok(HandlerOutcome::Complete)
//!     })
//!     .register("audit", |_: &serde_json::Value| Ok(HandlerOutcome::Ignored));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::model::ExecutionResult;

/// Fault raised by a handler. Always recorded as a failed attempt.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler reports for one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Complete,
    Ignored,
    Failed,
}

impl From<HandlerOutcome> for ExecutionResult {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Complete => ExecutionResult::Complete,
            HandlerOutcome::Ignored => ExecutionResult::Ignored,
            HandlerOutcome::Failed => ExecutionResult::Failed,
        }
    }
}

/// Performs the delivery side effect for one destination.
pub trait Handler: Send + Sync {
    fn handle(&self, payload: &Value) -> Result<HandlerOutcome, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Value) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    fn handle(&self, payload: &Value) -> Result<HandlerOutcome, HandlerError> {
        self(payload)
    }
}

/// Looks up the handler for a destination key.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, destination: &str) -> Option<Arc<dyn Handler>>;
}

/// Destination key to handler map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler function. Replaces any earlier handler for
    /// `destination`.
    pub fn register<F>(self, destination: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(destination, handler)
    }

    pub fn register_handler<H>(mut self, destination: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.handlers
            .insert(destination.to_string(), Arc::new(handler));
        self
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, destination: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(destination).cloned()
    }
}

impl<R: HandlerResolver + ?Sized> HandlerResolver for Arc<R> {
    fn resolve(&self, destination: &str) -> Option<Arc<dyn Handler>> {
        (**self).resolve(destination)
    }
}
