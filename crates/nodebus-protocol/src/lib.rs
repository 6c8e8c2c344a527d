//! # nodebus-protocol
//!
//! Link protocol between a nodebus manager and its process-kind nodes.
//!
//! A process node runs in a child OS process and reaches the bus through a
//! single link. This crate defines the frames carried over that link, the
//! length-prefixed MessagePack codec, and version negotiation.
//!
//! ## Frame Types
//!
//! - `Hello` / `Welcome` / `Start` - Handshake and start gate
//! - `Envelope` / `Reply` - Bus traffic and subscribe acknowledgements
//! - `Checkpoint` / `CheckpointReleased` - Group checkpoints
//! - `Exit` / `Goodbye` - Shutdown
//!
//! ## Example
//!
//! ```rust
//! use nodebus_protocol::{codec, Frame};
//!
//! let frame = Frame::publish("lidar", "lidar/scan", b"\x00\x01".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, write_frame, ProtocolError};
pub use frames::{EnvelopeKind, Frame, FrameType, Phase};
pub use version::{Version, VersionMismatch, PROTOCOL_VERSION};
