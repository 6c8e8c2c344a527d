//! Bus envelopes.
//!
//! An envelope is the unit carried by every queue on the bus: data
//! published to a topic, or a node's request to join or leave a topic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use nodebus_protocol::Frame;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::ByteBuf;

use crate::error::BusError;

pub use nodebus_protocol::EnvelopeKind;

/// A unique message identifier.
pub type MessageId = u64;

/// Node identity, unique per manager.
pub type NodeId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    now_nanos().wrapping_add(counter)
}

/// An immutable bus envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique message identifier.
    pub id: MessageId,
    /// What the envelope asks the broker to do.
    pub kind: EnvelopeKind,
    /// Node that created the envelope.
    pub sender: NodeId,
    /// Slash delimited topic.
    pub topic: String,
    /// Opaque payload, present only for publish envelopes.
    pub payload: Option<Bytes>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Envelope {
    fn new(
        kind: EnvelopeKind,
        sender: impl Into<NodeId>,
        topic: impl Into<String>,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            sender: sender.into(),
            topic: topic.into(),
            payload,
            timestamp: now_nanos() / 1_000_000,
        }
    }

    /// Create a publish envelope.
    #[must_use]
    pub fn publish(
        sender: impl Into<NodeId>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(EnvelopeKind::Publish, sender, topic, Some(payload.into()))
    }

    /// Create a subscribe request.
    #[must_use]
    pub fn subscribe(sender: impl Into<NodeId>, topic: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Subscribe, sender, topic, None)
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub fn unsubscribe(sender: impl Into<NodeId>, topic: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Unsubscribe, sender, topic, None)
    }

    /// Create a publish envelope with a MessagePack encoded value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn publish_value<T: Serialize + ?Sized>(
        sender: impl Into<NodeId>,
        topic: impl Into<String>,
        value: &T,
    ) -> Result<Self, BusError> {
        let payload = rmp_serde::to_vec_named(value)?;
        Ok(Self::publish(sender, topic, payload))
    }

    /// Get the payload bytes, empty for requests.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// Decode a MessagePack payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid encoding of `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(rmp_serde::from_slice(self.payload())?)
    }
}

/// Broker answer to a subscribe or unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Id of the request envelope.
    pub request: MessageId,
    /// Whether the request was accepted.
    pub accepted: bool,
}

impl Reply {
    /// Answer `envelope`.
    #[must_use]
    pub fn to(envelope: &Envelope, accepted: bool) -> Self {
        Self {
            request: envelope.id,
            accepted,
        }
    }
}

impl From<Reply> for Frame {
    fn from(reply: Reply) -> Self {
        Frame::reply(reply.request, reply.accepted)
    }
}

/// Keep the envelopes whose topic is exactly one of `topics`.
#[must_use]
pub fn filter_by_topic(envelopes: Vec<Envelope>, topics: &[&str]) -> Vec<Envelope> {
    let wanted: HashSet<&str> = topics.iter().copied().collect();
    envelopes
        .into_iter()
        .filter(|e| wanted.contains(e.topic.as_str()))
        .collect()
}

impl From<Envelope> for Frame {
    fn from(env: Envelope) -> Self {
        Frame::Envelope {
            id: env.id,
            kind: env.kind,
            sender: env.sender,
            topic: env.topic,
            payload: env.payload.map(|p| ByteBuf::from(p.to_vec())),
            timestamp: env.timestamp,
        }
    }
}

impl TryFrom<Frame> for Envelope {
    type Error = Frame;

    /// Hands back frames that do not carry an envelope.
    fn try_from(frame: Frame) -> Result<Self, Frame> {
        match frame {
            Frame::Envelope {
                id,
                kind,
                sender,
                topic,
                payload,
                timestamp,
            } => Ok(Envelope {
                id,
                kind,
                sender,
                topic,
                payload: payload.map(|p| Bytes::from(p.into_vec())),
                timestamp,
            }),
            other => Err(other),
        }
    }
}
