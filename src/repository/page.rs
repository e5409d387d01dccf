use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PaginationError;
use crate::model::{Dispatch, DispatchStatus, EventId, ResultStatus};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Direction of a listing. Rows are ordered by when they were committed,
/// which follows `createdAt` for writers that do not overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Position of the last item handed out: its `(commit sequence, id)` key.
///
/// Sequence numbers are assigned when a unit of work commits, so a row whose
/// unit of work finishes late still sorts after every token issued before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "o")]
    pub order: SortOrder,
    #[serde(rename = "s")]
    pub seq: u64,
    #[serde(rename = "i")]
    pub id: Uuid,
}

impl Cursor {
    pub fn key(&self) -> (u64, Uuid) {
        (self.seq, self.id)
    }
}

/// Opaque resume point returned with a page that has more items behind it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn encode(cursor: &Cursor) -> Self {
        // A cursor is plain data; serializing it cannot fail.
        let json = serde_json::to_vec(cursor).unwrap_or_default();
        Self(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode and check the token belongs to a listing in `order`.
    pub fn decode(&self, order: SortOrder) -> Result<Cursor, PaginationError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .map_err(|_| PaginationError::InvalidToken)?;
        let cursor: Cursor =
            serde_json::from_slice(&bytes).map_err(|_| PaginationError::InvalidToken)?;
        if cursor.order != order {
            return Err(PaginationError::OrderMismatch {
                issued: cursor.order.as_str(),
                requested: order.as_str(),
            });
        }
        Ok(cursor)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContinuationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ContinuationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Page size, direction and resume point of a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    pub max_items: usize,
    #[serde(default)]
    pub continuation: Option<ContinuationToken>,
    #[serde(default)]
    pub order: SortOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_PAGE_SIZE,
            continuation: None,
            order: SortOrder::Asc,
        }
    }
}

impl ListOptions {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            ..Default::default()
        }
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Desc;
        self
    }

    pub fn after(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation = token;
        self
    }

    /// Decoded resume point, if any.
    pub fn cursor(&self) -> Result<Option<Cursor>, PaginationError> {
        self.continuation
            .as_ref()
            .map(|token| token.decode(self.order))
            .transpose()
    }
}

/// Up to `max_items` items plus a token iff more remain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<ContinuationToken>,
}

/// Status predicate for dispatch listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusFilter {
    Ongoing,
    Resulted,
    Is(ResultStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: &DispatchStatus) -> bool {
        match self {
            StatusFilter::Ongoing => status.is_ongoing(),
            StatusFilter::Resulted => !status.is_ongoing(),
            StatusFilter::Is(expected) => status.result() == Some(*expected),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFilter {
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub status: Option<StatusFilter>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl DispatchFilter {
    pub fn ongoing() -> Self {
        Self {
            status: Some(StatusFilter::Ongoing),
            ..Default::default()
        }
    }

    pub fn for_event(event_id: EventId) -> Self {
        Self {
            event_id: Some(event_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, dispatch: &Dispatch) -> bool {
        self.event_id.map_or(true, |id| dispatch.event_id() == id)
            && self
                .destination
                .as_deref()
                .map_or(true, |d| dispatch.destination() == d)
            && self
                .status
                .map_or(true, |s| s.matches(&dispatch.status()))
            && in_window(dispatch.created_at(), self.created_after, self.created_before)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn matches(&self, created_at: DateTime<Utc>) -> bool {
        in_window(created_at, self.created_after, self.created_before)
    }
}

/// `after` is exclusive, `before` is exclusive.
fn in_window(
    at: DateTime<Utc>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> bool {
    after.map_or(true, |a| at > a) && before.map_or(true, |b| at < b)
}
