use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Dispatch, EventId};

/// An immutable ingested fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// An event together with every dispatch created for it, oldest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWithDispatches {
    pub event: Event,
    pub dispatches: Vec<Dispatch>,
}
