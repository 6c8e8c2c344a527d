//! Frame types for the nodebus link protocol.
//!
//! Frames are exchanged between the manager process and each process-kind
//! node over its link. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::version::Version;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Start = 0x03,
    Envelope = 0x04,
    Reply = 0x05,
    Exit = 0x06,
    Checkpoint = 0x07,
    CheckpointReleased = 0x08,
    Goodbye = 0x09,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Welcome),
            0x03 => Ok(FrameType::Start),
            0x04 => Ok(FrameType::Envelope),
            0x05 => Ok(FrameType::Reply),
            0x06 => Ok(FrameType::Exit),
            0x07 => Ok(FrameType::Checkpoint),
            0x08 => Ok(FrameType::CheckpointReleased),
            0x09 => Ok(FrameType::Goodbye),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Kind of a bus envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Data addressed to a topic.
    Publish = 1,
    /// Request to add the sender to a topic.
    Subscribe = 2,
    /// Request to remove the sender from a topic.
    Unsubscribe = 3,
}

impl From<EnvelopeKind> for u8 {
    fn from(kind: EnvelopeKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EnvelopeKind::Publish),
            2 => Ok(EnvelopeKind::Subscribe),
            3 => Ok(EnvelopeKind::Unsubscribe),
            _ => Err("Invalid envelope kind"),
        }
    }
}

/// Checkpoint phase of a node group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Phase {
    /// Nodes may start acquiring their resources.
    Setup = 0,
    /// Nodes may enter their main loop.
    Ready = 1,
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase as u8
    }
}

impl TryFrom<u8> for Phase {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Phase::Setup),
            1 => Ok(Phase::Ready),
            _ => Err("Invalid checkpoint phase"),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Setup => f.write_str("setup"),
            Phase::Ready => f.write_str("ready"),
        }
    }
}

/// A link frame.
///
/// The child opens with `Hello`, the manager answers with `Welcome` and
/// later `Start`. After that both sides exchange `Envelope` frames until
/// one of them sends `Exit` or the child sends `Goodbye`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame sent by a child process.
    #[serde(rename = "hello")]
    Hello {
        /// Node name the child was spawned for.
        node: String,
        /// Protocol version spoken by the child.
        version: Version,
    },

    /// Manager's answer to `Hello`.
    #[serde(rename = "welcome")]
    Welcome {
        /// Process table entry to run.
        entry: String,
        /// JSON encoded entry arguments.
        args: String,
        /// Poll interval for the child's loops.
        poll_interval_ms: u64,
        /// Capacity of the child's inbound queue.
        inbound_capacity: u32,
        /// Capacity of the child's outbound queue.
        outbound_capacity: u32,
        /// Timeout applied to `publish`.
        publish_timeout_us: u64,
    },

    /// The process start gate was released.
    #[serde(rename = "start")]
    Start,

    /// A bus envelope.
    #[serde(rename = "envelope")]
    Envelope {
        /// Message identifier.
        id: u64,
        /// Envelope kind.
        kind: EnvelopeKind,
        /// Sending node.
        sender: String,
        /// Slash delimited topic.
        topic: String,
        /// Opaque payload, present for publish envelopes.
        payload: Option<ByteBuf>,
        /// Creation time in milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Broker reply to one subscribe or unsubscribe.
    #[serde(rename = "reply")]
    Reply {
        /// Id of the request envelope.
        request: u64,
        /// Whether the request was accepted.
        ok: bool,
    },

    /// The sender's exit flag is set.
    #[serde(rename = "exit")]
    Exit,

    /// The child arrived at a group checkpoint.
    #[serde(rename = "checkpoint")]
    Checkpoint {
        /// Group name.
        group: String,
        /// Checkpoint phase.
        phase: Phase,
        /// How long the manager should wait on the child's behalf.
        timeout_ms: u64,
    },

    /// Outcome of the child's last checkpoint arrival.
    #[serde(rename = "checkpoint_released")]
    CheckpointReleased {
        /// `false` if the checkpoint broke or timed out.
        ok: bool,
    },

    /// The child's entry function returned.
    #[serde(rename = "goodbye")]
    Goodbye,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Start => FrameType::Start,
            Frame::Envelope { .. } => FrameType::Envelope,
            Frame::Reply { .. } => FrameType::Reply,
            Frame::Exit => FrameType::Exit,
            Frame::Checkpoint { .. } => FrameType::Checkpoint,
            Frame::CheckpointReleased { .. } => FrameType::CheckpointReleased,
            Frame::Goodbye => FrameType::Goodbye,
        }
    }

    /// Create a new Hello frame.
    #[must_use]
    pub fn hello(node: impl Into<String>, version: Version) -> Self {
        Frame::Hello {
            node: node.into(),
            version,
        }
    }

    /// Create a new Publish envelope frame.
    #[must_use]
    pub fn publish(
        sender: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Frame::Envelope {
            id: 0,
            kind: EnvelopeKind::Publish,
            sender: sender.into(),
            topic: topic.into(),
            payload: Some(ByteBuf::from(payload.into())),
            timestamp: 0,
        }
    }

    /// Create a new Subscribe envelope frame.
    #[must_use]
    pub fn subscribe(sender: impl Into<String>, topic: impl Into<String>) -> Self {
        Frame::Envelope {
            id: 0,
            kind: EnvelopeKind::Subscribe,
            sender: sender.into(),
            topic: topic.into(),
            payload: None,
            timestamp: 0,
        }
    }

    /// Create a new Reply frame.
    #[must_use]
    pub fn reply(request: u64, ok: bool) -> Self {
        Frame::Reply { request, ok }
    }

    /// Create a new Checkpoint frame.
    #[must_use]
    pub fn checkpoint(group: impl Into<String>, phase: Phase, timeout_ms: u64) -> Self {
        Frame::Checkpoint {
            group: group.into(),
            phase,
            timeout_ms,
        }
    }
}
