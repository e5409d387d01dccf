use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Condition;
use crate::model::{EventId, NewDispatch};
use crate::retry::RetryPolicy;

/// Hub-wide fallbacks for routes that leave an override unset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefaults {
    #[serde(default)]
    pub delay_seconds: Option<u32>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay: Option<RetryPolicy>,
}

/// A condition tree plus where to send matching events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub condition: Condition,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<RetryPolicy>,
}

impl Route {
    pub fn new(condition: Condition, destination: impl Into<String>) -> Self {
        Self {
            condition,
            destination: destination.into(),
            delay_seconds: None,
            max_retries: None,
            retry_delay: None,
        }
    }

    pub fn with_delay_seconds(mut self, delay: u32) -> Self {
        self.delay_seconds = Some(delay);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_retry_delay(mut self, policy: RetryPolicy) -> Self {
        self.retry_delay = Some(policy);
        self
    }

    fn resolve(&self, defaults: &RouteDefaults) -> DispatchTemplate {
        DispatchTemplate {
            destination: self.destination.clone(),
            delay_seconds: self.delay_seconds.or(defaults.delay_seconds),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.or(defaults.retry_delay),
        }
    }
}

/// Effective parameters of one matched route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchTemplate {
    pub destination: String,
    pub delay_seconds: Option<u32>,
    pub max_retries: u32,
    pub retry_delay: Option<RetryPolicy>,
}

impl DispatchTemplate {
    pub fn for_event(self, event_id: EventId) -> NewDispatch {
        NewDispatch {
            event_id,
            destination: self.destination,
            delay_seconds: self.delay_seconds,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        }
    }
}

/// Ordered routes plus their shared defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub defaults: RouteDefaults,
}

impl RoutingConfig {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes,
            defaults: RouteDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: RouteDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Matched routes for `payload`, in route order.
    pub fn route(&self, payload: &Value) -> Vec<DispatchTemplate> {
        self.routes
            .iter()
            .filter(|route| route.condition.evaluate(payload))
            .map(|route| route.resolve(&self.defaults))
            .collect()
    }
}
