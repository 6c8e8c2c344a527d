//! Length-prefixed MessagePack codec for link frames.
//!
//! Every frame on a link is a 4 byte big-endian length followed by the
//! MessagePack body. Readers reassemble frames from a buffer with
//! [`decode_from`]; writers put whole frames on a stream with [`write_frame`].

use std::io::{self, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// Underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn encode_body(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

fn read_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = encode_body(frame)?;

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(())
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = read_length([data[0], data[1], data[2], data[3]])?;
    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` while the buffer holds less than one whole frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = read_length([buf[0], buf[1], buf[2], buf[3]])?;
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Write one frame to a blocking writer and flush it.
///
/// The frame is encoded first and written with a single `write_all`, so an
/// encoding failure never leaves a partial frame on the stream.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<usize, ProtocolError> {
    let data = encode(frame)?;
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{EnvelopeKind, Phase};
    use crate::version::PROTOCOL_VERSION;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::hello("display", PROTOCOL_VERSION),
            Frame::publish("lidar", "lidar/scan", b"\x01\x02\x03".to_vec()),
            Frame::subscribe("display", "slam"),
            Frame::reply(42, false),
            Frame::checkpoint("mapping", Phase::Ready, 10_000),
            Frame::Start,
            Frame::Goodbye,
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_envelope_kind_on_wire() {
        let frame = Frame::Envelope {
            id: 7,
            kind: EnvelopeKind::Unsubscribe,
            sender: "a".into(),
            topic: "x/y".into(),
            payload: None,
            timestamp: 1,
        };
        match decode(&encode(&frame).unwrap()).unwrap() {
            Frame::Envelope { kind, id, .. } => {
                assert_eq!(kind, EnvelopeKind::Unsubscribe);
                assert_eq!(id, 7);
            }
            other => panic!("Expected Envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::subscribe("a", "test")).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::publish("a", "big", vec![0u8; MAX_FRAME_SIZE + 1]);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::subscribe("a", "test1");
        let frame2 = Frame::Exit;

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // A truncated tail is left in place
        let tail = buf.split_off(buf.len() - 2);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame1));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.unsplit(tail);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_frame_then_stream_decode() {
        let mut wire = Vec::new();
        let first = write_frame(&mut wire, &Frame::reply(9, true)).unwrap();
        write_frame(&mut wire, &Frame::Exit).unwrap();
        assert_eq!(first, encode(&Frame::reply(9, true)).unwrap().len());

        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::reply(9, true)));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::Exit));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_write_frame_too_large_writes_nothing() {
        let mut wire = Vec::new();
        let frame = Frame::publish("a", "big", vec![0u8; MAX_FRAME_SIZE + 1]);

        assert!(matches!(
            write_frame(&mut wire, &frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        assert!(wire.is_empty());
    }
}
