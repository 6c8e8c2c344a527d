//! Link abstraction traits for nodebus.
//!
//! A link carries frames between the manager and one process node. It is
//! split into a sending half shared by several threads and a receiving
//! half owned by a single reader loop.

use std::io;
use std::time::Duration;

use nodebus_protocol::Frame;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the link.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] nodebus_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent an unexpected frame during the handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classify an I/O error, folding peer disconnects into `ConnectionClosed`.
    #[must_use]
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        }
    }

    /// Whether the link is unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout)
    }
}

/// Sending half of a link.
pub trait FrameSink: Send + Sync {
    /// Send a frame.
    ///
    /// `timeout` bounds how long the caller waits for other senders on the
    /// same link. `Some(Duration::ZERO)` fails immediately when the link is
    /// busy, `None` waits indefinitely. The write itself blocks until the
    /// peer has room for the whole frame.
    fn send_frame(&self, frame: &Frame, timeout: Option<Duration>) -> Result<(), TransportError>;

    /// Close the link in both directions.
    fn close(&self);

    /// Check if the link is still open.
    fn is_open(&self) -> bool;
}

/// Receiving half of a link.
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the link cleanly and
    /// `Err(TransportError::Timeout)` if no whole frame arrived in time.
    fn recv_frame(&mut self, timeout: Option<Duration>) -> Result<Option<Frame>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let err = TransportError::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, TransportError::Timeout));
        assert!(!err.is_fatal());

        let err = TransportError::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(err.is_fatal());

        let err = TransportError::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, TransportError::Io(_)));
    }
}
