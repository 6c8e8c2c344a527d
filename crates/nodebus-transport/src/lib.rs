//! # nodebus-transport
//!
//! Link transports for nodebus process nodes.
//!
//! A process node runs in its own OS process and exchanges frames with the
//! manager over a link. Links are split into a [`FrameSink`] shared by the
//! manager's writer threads and a [`FrameSource`] owned by one reader loop.
//!
//! The only transport is a loopback TCP socket:
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//! use nodebus_transport::{FrameSource, LoopbackListener};
//!
//! # fn main() -> Result<(), nodebus_transport::TransportError> {
//! let listener = LoopbackListener::bind()?;
//! let cancel = AtomicBool::new(false);
//! let link = listener.accept_timeout(Duration::from_secs(10), &cancel)?;
//! let (_writer, mut reader) = link.split()?;
//! while let Some(frame) = reader.recv_frame(None)? {
//!     println!("{:?}", frame);
//! }
//! # Ok(())
//! # }
//! ```

pub mod loopback;
pub mod traits;

pub use loopback::{LinkReader, LinkWriter, LoopbackLink, LoopbackListener};
pub use traits::{FrameSink, FrameSource, TransportError};
