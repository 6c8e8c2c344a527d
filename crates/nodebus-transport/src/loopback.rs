//! Loopback TCP link implementation.
//!
//! The manager binds one listener per process node on `127.0.0.1` with an
//! ephemeral port and passes the address to the child, which connects back.

use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nodebus_protocol::{codec, Frame, ProtocolError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::traits::{FrameSink, FrameSource, TransportError};

/// How often a pending accept re-checks its deadline and cancel flag.
const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Read chunk size.
const READ_CHUNK: usize = 8 * 1024;

/// A listener waiting for one child to connect back.
pub struct LoopbackListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl LoopbackListener {
    /// Bind to an ephemeral loopback port.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub fn bind() -> Result<Self, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        debug!(addr = %local_addr, "Link listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the address children should connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for a connection.
    ///
    /// Gives up with `Timeout` after `timeout`, or with `ConnectionClosed`
    /// as soon as `cancel` is set.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, cancellation, or socket failure.
    pub fn accept_timeout(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<LoopbackLink, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(addr = %self.local_addr, peer = %peer, "Link accepted");
                    stream.set_nonblocking(false)?;
                    return LoopbackLink::from_stream(stream, peer);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if cancel.load(Ordering::Acquire) {
                        return Err(TransportError::ConnectionClosed);
                    }
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// An established link before it is split into halves.
pub struct LoopbackLink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl LoopbackLink {
    /// Connect to a listening manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be made within `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::from_io)?;
        Self::from_stream(stream, addr)
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    /// Get the peer address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Split into a shareable writer and an owned reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be duplicated.
    pub fn split(self) -> Result<(Arc<LinkWriter>, LinkReader), TransportError> {
        let read_stream = self.stream.try_clone()?;

        let writer = Arc::new(LinkWriter {
            stream: Mutex::new(self.stream),
            open: AtomicBool::new(true),
        });
        let reader = LinkReader {
            stream: read_stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            read_timeout: None,
        };

        Ok((writer, reader))
    }
}

/// Sending half of a loopback link.
pub struct LinkWriter {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

impl FrameSink for LinkWriter {
    fn send_frame(&self, frame: &Frame, timeout: Option<Duration>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut stream = match timeout {
            None => self.stream.lock(),
            Some(t) if t.is_zero() => self.stream.try_lock().ok_or(TransportError::Timeout)?,
            Some(t) => self.stream.try_lock_for(t).ok_or(TransportError::Timeout)?,
        };

        match codec::write_frame(&mut *stream, frame) {
            Ok(bytes) => {
                trace!(frame_type = ?frame.frame_type(), bytes, "Frame sent");
                Ok(())
            }
            Err(ProtocolError::Io(e)) => {
                self.open.store(false, Ordering::Release);
                Err(TransportError::from_io(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Shutting down the socket also wakes the reader half.
            let _ = self.stream.lock().shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Receiving half of a loopback link.
pub struct LinkReader {
    stream: TcpStream,
    buffer: BytesMut,
    read_timeout: Option<Duration>,
}

impl LinkReader {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        // A zero read timeout is rejected by the OS.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        if timeout != self.read_timeout {
            self.stream.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }
        Ok(())
    }
}

impl FrameSource for LinkReader {
    fn recv_frame(&mut self, timeout: Option<Duration>) -> Result<Option<Frame>, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(frame) = codec::decode_from(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TransportError::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };
            self.set_read_timeout(remaining)?;

            match self.stream.read(&mut chunk) {
                Ok(0) if self.buffer.is_empty() => return Ok(None),
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::from_io(e)),
            }
        }
    }
}
