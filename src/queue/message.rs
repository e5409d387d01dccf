use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QueueError;
use crate::model::{Dispatch, DispatchId};
use crate::retry::RetryPolicy;

/// Content-type tag of bodies produced by [`QueueMessage::encode`].
pub const BITCODE_CONTENT_TYPE: &str = "application/x-bitcode";

/// What the dispatcher needs to execute (and later back off) one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchMessage {
    pub dispatch_id: DispatchId,
    pub retry_delay: Option<RetryPolicy>,
}

impl DispatchMessage {
    pub fn for_dispatch(dispatch: &Dispatch) -> Self {
        Self {
            dispatch_id: dispatch.id(),
            retry_delay: dispatch.retry_delay().copied(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    dispatch_id: u128,
    retry_delay: Option<RetryPolicy>,
}

/// An envelope as handed to the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Initial visibility delay.
    pub delay_seconds: Option<u32>,
}

impl QueueMessage {
    pub fn encode(
        message: &DispatchMessage,
        delay_seconds: Option<u32>,
    ) -> Result<Self, QueueError> {
        let wire = WireMessage {
            dispatch_id: message.dispatch_id.0.as_u128(),
            retry_delay: message.retry_delay,
        };
        let body = bitcode::serialize(&wire).map_err(|e| QueueError::Encode(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            content_type: BITCODE_CONTENT_TYPE.to_string(),
            body,
            delay_seconds,
        })
    }

    pub fn decode(&self) -> Result<DispatchMessage, QueueError> {
        if self.content_type != BITCODE_CONTENT_TYPE {
            return Err(QueueError::Decode(format!(
                "unsupported content type `{}`",
                self.content_type
            )));
        }
        let wire: WireMessage =
            bitcode::deserialize(&self.body).map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok(DispatchMessage {
            dispatch_id: DispatchId(Uuid::from_u128(wire.dispatch_id)),
            retry_delay: wire.retry_delay,
        })
    }
}

/// A message handed to a consumer, with how many times it has been
/// delivered (1 on first delivery).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub message: QueueMessage,
    pub attempts: u32,
}
