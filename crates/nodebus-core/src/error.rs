//! Error types for the bus.

use thiserror::Error;

use crate::topic::TopicError;

/// Errors surfaced by the manager and the node free functions.
///
/// Delivery failures and acknowledgement timeouts are not errors: the
/// broker logs and counts drops, and `subscribe` reports `false`.
#[derive(Debug, Error)]
pub enum BusError {
    /// A node with this name is already registered.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// A group with this name already exists.
    #[error("Duplicate group name: {0}")]
    DuplicateGroup(String),

    /// Nodes cannot be registered once started.
    #[error("Manager already started")]
    AlreadyStarted,

    /// No node with this name is registered.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// No group with this name exists.
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    /// Topic tree update failed.
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// A bus operation was called outside of a managed node.
    #[error("No node context on this thread")]
    NoContext,

    /// A child asked for an entry missing from the process table.
    #[error("Unknown process entry: {0}")]
    UnknownEntry(String),

    /// Payload encoding failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload decoding failed.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Process arguments could not be (de)serialized.
    #[error("Argument error: {0}")]
    Json(#[from] serde_json::Error),

    /// Link transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] nodebus_transport::TransportError),

    /// Link protocol failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] nodebus_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link handshake did not complete.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A child process could not be spawned.
    #[error("Failed to spawn node {node}: {source}")]
    Spawn {
        /// Node name.
        node: String,
        /// Underlying error.
        source: std::io::Error,
    },
}
