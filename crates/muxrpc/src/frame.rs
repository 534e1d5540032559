//! Frame types and their wire layout.
//!
//! Every frame travels as:
//!
//! ```text
//! u32 BE  length     (bytes following this field: 6 + payload)
//! u32 BE  stream id
//! u8      kind
//! u8      flags
//! [u8]    payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;

use crate::error::FrameError;
use crate::status::Status;

/// Identifies one logical stream on a connection.
pub type StreamId = u32;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the fixed header following the length prefix.
pub const FRAME_HEADER_LEN: usize = 6;

/// The status of a call whose payload cannot fit in one frame.
///
/// Raised before anything is queued: a peer reads an oversized frame as a
/// desync of the whole connection.
pub(crate) fn oversized(what: &str, len: usize, max: usize) -> Status {
    Status::resource_exhausted(format!(
        "{what} of {len} bytes exceeds the maximum frame size of {max}"
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a call (client to server) or accepts it (server to client).
    Headers = 1,
    /// Carries exactly one encoded message.
    Data = 2,
    /// Terminal status (server to client) or request half-close (client to server).
    Trailers = 3,
    /// Aborts the stream, or acknowledges an abort when flagged `ACK`.
    Cancel = 4,
    /// Returns receive credit to the sender, counted in messages.
    WindowUpdate = 5,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Headers),
            2 => Some(FrameKind::Data),
            3 => Some(FrameKind::Trailers),
            4 => Some(FrameKind::Cancel),
            5 => Some(FrameKind::WindowUpdate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The sender will send nothing more in this direction.
    pub const END_STREAM: FrameFlags = FrameFlags(0x01);
    /// Acknowledges a cancel received from the peer.
    pub const ACK: FrameFlags = FrameFlags(0x02);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped so that newer peers stay readable.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        FrameFlags(bits & (Self::END_STREAM.0 | Self::ACK.0))
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FrameFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::END_STREAM) {
            names.push("END_STREAM");
        }
        if self.contains(Self::ACK) {
            names.push("ACK");
        }
        write!(f, "FrameFlags({})", names.join(" | "))
    }
}

/// The smallest unit of wire transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: StreamId, kind: FrameKind, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            flags,
            payload,
        }
    }

    pub fn headers(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Headers, FrameFlags::empty(), payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream {
            FrameFlags::END_STREAM
        } else {
            FrameFlags::empty()
        };
        Self::new(stream_id, FrameKind::Data, flags, payload)
    }

    /// Terminal status sent by the serving side.
    pub fn trailers(stream_id: StreamId, status: &Status) -> Self {
        Self::new(
            stream_id,
            FrameKind::Trailers,
            FrameFlags::END_STREAM,
            status.to_wire(),
        )
    }

    /// Empty trailers sent by the calling side once it is done sending.
    pub fn half_close(stream_id: StreamId) -> Self {
        Self::new(
            stream_id,
            FrameKind::Trailers,
            FrameFlags::END_STREAM,
            Bytes::new(),
        )
    }

    pub fn cancel(stream_id: StreamId, reason: &Status) -> Self {
        Self::new(
            stream_id,
            FrameKind::Cancel,
            FrameFlags::END_STREAM,
            reason.to_wire(),
        )
    }

    pub fn cancel_ack(stream_id: StreamId) -> Self {
        Self::new(
            stream_id,
            FrameKind::Cancel,
            FrameFlags::END_STREAM | FrameFlags::ACK,
            Bytes::new(),
        )
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::WindowUpdate,
            FrameFlags::empty(),
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.contains(FrameFlags::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(FrameFlags::ACK)
    }

    /// The credit carried by a `WindowUpdate` frame.
    pub fn window_increment(&self) -> Option<u32> {
        if self.kind != FrameKind::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// The reason carried by a non-acknowledging `Cancel` frame.
    pub fn cancel_reason(&self) -> Status {
        if self.payload.is_empty() {
            return Status::cancelled("cancelled by peer");
        }
        let status = Status::from_wire(self.payload.clone());
        if status.is_ok() {
            Status::cancelled("cancelled by peer")
        } else {
            status
        }
    }

    /// Total bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + FRAME_HEADER_LEN + self.payload.len()
    }

    /// Append the frame to `dst`. Fails without writing anything when the
    /// payload cannot be described by the `u32` length prefix.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = FRAME_HEADER_LEN + self.payload.len();
        let prefix = u32::try_from(len).map_err(|_| FrameError::TooLarge {
            len,
            max: u32::MAX as usize,
        })?;

        dst.reserve(self.encoded_len());
        dst.put_u32(prefix);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flags.bits());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
    /// buffer is left untouched in that case. A frame of unknown kind is
    /// consumed and reported as `UnknownKind` so that reading can continue.
    pub fn decode(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len < FRAME_HEADER_LEN {
            return Err(FrameError::TooSmall(len));
        }
        let max = max_frame_size.saturating_add(FRAME_HEADER_LEN);
        if len > max {
            return Err(FrameError::TooLarge { len, max });
        }

        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut body = src.split_to(len);
        let stream_id = body.get_u32();
        let kind = body.get_u8();
        let flags = FrameFlags::from_bits_truncate(body.get_u8());
        let payload = body.freeze();

        let kind = FrameKind::from_u8(kind).ok_or(FrameError::UnknownKind { stream_id, kind })?;

        Ok(Some(Frame {
            stream_id,
            kind,
            flags,
            payload,
        }))
    }
}

/// The payload of the `Headers` frame that opens a call.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CallHeader {
    #[prost(string, tag = "1")]
    pub path: String,
    /// Time the caller is willing to wait, relative to when the frame was sent.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_micros: Option<u64>,
    #[prost(string, tag = "3")]
    pub request_type: String,
    #[prost(string, tag = "4")]
    pub response_type: String,
    /// A list rather than a map so the header encodes deterministically.
    #[prost(message, repeated, tag = "5")]
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct MetadataEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use proptest::prelude::*;

    const MAX: usize = 1024;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let frame = Frame::data(7, Bytes::from_static(b"hello"), false);
        let full = encode(&frame);

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(Frame::decode(&mut partial, MAX).unwrap(), None);
        assert_eq!(partial.len(), full.len() - 1);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(Frame::decode(&mut partial, MAX).unwrap(), Some(frame));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let first = Frame::headers(1, Bytes::from_static(b"h"));
        let second = Frame::half_close(1);
        let mut buf = encode(&first);
        second.encode(&mut buf).unwrap();

        assert_eq!(Frame::decode(&mut buf, MAX).unwrap(), Some(first));
        assert_eq!(Frame::decode(&mut buf, MAX).unwrap(), Some(second));
        assert_eq!(Frame::decode(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX + FRAME_HEADER_LEN + 1) as u32);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_encoded_prefix_matches_decoder_limit() {
        let frame = Frame::data(3, Bytes::from(vec![7u8; MAX]), false);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());
        assert_eq!(&buf[..LENGTH_PREFIX_LEN], &((MAX + FRAME_HEADER_LEN) as u32).to_be_bytes());
        assert_eq!(Frame::decode(&mut buf, MAX).unwrap(), Some(frame));
    }

    #[test]
    fn test_oversized_status_is_resource_exhausted() {
        let status = oversized("request message", 4096, 1024);
        assert_eq!(status.code(), crate::status::Code::ResourceExhausted);
        assert!(status.message().contains("4096"));
    }

    #[test]
    fn test_undersized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0, 0, 0]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(FrameError::TooSmall(3))
        ));
    }

    #[test]
    fn test_unknown_kind_is_consumed() {
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_HEADER_LEN as u32 + 2);
        buf.put_u32(9);
        buf.put_u8(77);
        buf.put_u8(0);
        buf.put_slice(b"zz");
        Frame::window_update(9, 3).encode(&mut buf).unwrap();

        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(FrameError::UnknownKind {
                stream_id: 9,
                kind: 77
            })
        ));
        let next = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(next.window_increment(), Some(3));
    }

    #[test]
    fn test_cancel_reason_defaults_to_cancelled() {
        assert_eq!(Frame::cancel_ack(3).cancel_reason().code(), Code::Cancelled);

        let reason = Status::deadline_exceeded("too slow");
        let frame = Frame::cancel(3, &reason);
        assert_eq!(frame.cancel_reason(), reason);
        assert!(!frame.is_ack());
        assert!(Frame::cancel_ack(3).is_ack());
    }

    #[test]
    fn test_unknown_flag_bits_are_dropped() {
        let flags = FrameFlags::from_bits_truncate(0xff);
        assert!(flags.contains(FrameFlags::END_STREAM));
        assert!(flags.contains(FrameFlags::ACK));
        assert_eq!(flags.bits(), 0x03);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut buf = BytesMut::from(&bytes[..]);
            // Keep decoding until the buffer is exhausted or the stream desyncs.
            loop {
                match Frame::decode(&mut buf, MAX) {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => break,
                    Err(_) => continue,
                }
            }
        }

        #[test]
        fn prop_frames_roundtrip(stream_id in any::<u32>(), kind in 1u8..=5, flags in 0u8..4, payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let frame = Frame::new(
                stream_id,
                FrameKind::from_u8(kind).unwrap(),
                FrameFlags::from_bits_truncate(flags),
                Bytes::from(payload),
            );
            let mut buf = encode(&frame);
            prop_assert_eq!(Frame::decode(&mut buf, MAX).unwrap(), Some(frame));
            prop_assert!(buf.is_empty());
        }
    }
}
