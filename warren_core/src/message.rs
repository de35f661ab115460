use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{methods::Table, SingleVec};

pub type Message = Arc<MessageInner>;

/// Monotonic per-vhost message identifier, assigned at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// The content properties carried in a message's header frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<Table>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// A message as routed and queued. Immutable after assembly: one `Arc` is
/// shared by every queue the message fanned out to, so nothing per-queue
/// (like delivery bookkeeping) lives here.
#[derive(Debug)]
pub struct MessageInner {
    pub id: MessageId,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: Properties,
    pub body: SingleVec<Bytes>,
}

impl MessageInner {
    pub fn new(
        id: MessageId,
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        properties: Properties,
        body: SingleVec<Bytes>,
    ) -> Message {
        Arc::new(Self {
            id,
            exchange,
            routing_key,
            mandatory,
            immediate,
            properties,
            body,
        })
    }

    pub fn body_size(&self) -> u64 {
        self.body.iter().map(|chunk| chunk.len() as u64).sum()
    }

    /// Whether the payload must survive a broker restart when queued on a
    /// durable queue.
    pub fn is_persistent(&self) -> bool {
        self.properties.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }
}
