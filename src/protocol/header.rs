//! Frame header encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌──────────────┬───────┬──────────────┬──────────────────┐
//! │ Length       │ Flags │ Type         │ Stream ID        │
//! │ 2 bytes      │ 1 byte│ 1 byte       │ 4 bytes          │
//! │ 14 bits used │       │ 5 bits used  │ 31 bits used     │
//! └──────────────┴───────┴──────────────┴──────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. Reserved bits are written as zero
//! and masked off when read, so a peer that sets them is never misread.

use std::fmt;

use crate::error::{MuxError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Mask applied to the length field.
pub const LENGTH_MASK: u16 = 0x3FFF;

/// Mask applied to the type field.
pub const TYPE_MASK: u8 = 0x1F;

/// Mask applied to the stream id field.
pub const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = LENGTH_MASK as usize;

/// Identifier of a logical stream (31 bits).
pub type StreamId = u32;

/// First frame type available to extensions.
pub const MIN_EXTENSION_FRAME_TYPE: u8 = 0x10;

/// Frame types understood by the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new stream.
    StreamSyn = 0x1,
    /// Aborts a stream with an error code.
    StreamRst = 0x2,
    /// Carries stream bytes, optionally with FIN.
    StreamData = 0x3,
    /// Grants send-window credit to the peer.
    StreamWndInc = 0x4,
    /// Announces that the session is terminating.
    GoAway = 0x6,
}

impl FrameType {
    /// Classify a (masked) raw type value.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw & TYPE_MASK {
            0x1 => Some(FrameType::StreamSyn),
            0x2 => Some(FrameType::StreamRst),
            0x3 => Some(FrameType::StreamData),
            0x4 => Some(FrameType::StreamWndInc),
            0x6 => Some(FrameType::GoAway),
            _ => None,
        }
    }

    /// Raw wire value.
    #[inline]
    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Sender will send no more data on this stream (SYN and DATA).
    pub const FIN: u8 = 0b0000_0001;
    /// SYN payload carries a priority.
    pub const HAS_PRIORITY: u8 = 0b0000_0010;
    /// SYN payload carries a stream type.
    pub const HAS_TYPE: u8 = 0b0000_0100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// A frame header as it appears on the wire.
///
/// The header is stored encoded; accessors decode and mask on every call.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Header([u8; HEADER_SIZE]);

impl Header {
    /// Build a header, validating length and stream id.
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(FrameType::StreamRst.as_raw(), 4, 0x2843, 0).unwrap();
    /// assert_eq!(header.as_bytes(), &[0, 0x4, 0, 0x2, 0, 0, 0x28, 0x43]);
    /// ```
    pub fn new(frame_type: u8, length: usize, stream_id: StreamId, flags: u8) -> Result<Self> {
        let mut header = Header::default();
        header.set_all(frame_type, length, stream_id, flags)?;
        Ok(header)
    }

    /// Overwrite every field.
    ///
    /// Fails if `length > 0x3FFF` or `stream_id > 0x7FFFFFFF`. Type and flags are
    /// not validated; the top three type bits are dropped.
    pub fn set_all(
        &mut self,
        frame_type: u8,
        length: usize,
        stream_id: StreamId,
        flags: u8,
    ) -> Result<()> {
        if length > MAX_FRAME_PAYLOAD {
            return Err(MuxError::InvalidFrameSize(length));
        }
        if stream_id > STREAM_ID_MASK {
            return Err(MuxError::InvalidStreamId(stream_id));
        }

        self.0[0..2].copy_from_slice(&(length as u16).to_be_bytes());
        self.0[2] = flags;
        self.0[3] = frame_type & TYPE_MASK;
        self.0[4..8].copy_from_slice(&stream_id.to_be_bytes());
        Ok(())
    }

    /// Wrap raw header bytes. Never fails; reserved bits are masked by the accessors.
    #[inline]
    pub const fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Header(bytes)
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `None` only if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Header(bytes))
    }

    /// The encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }

    /// Payload length (14 bits).
    #[inline]
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]]) & LENGTH_MASK
    }

    /// Flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.0[2]
    }

    /// Frame type (5 bits).
    #[inline]
    pub fn raw_type(&self) -> u8 {
        self.0[3] & TYPE_MASK
    }

    /// Frame type, if it is one the session itself handles.
    #[inline]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_raw(self.raw_type())
    }

    /// Stream id (31 bits).
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]) & STREAM_ID_MASK
    }

    /// Check if FIN is set.
    #[inline]
    pub fn is_fin(&self) -> bool {
        flags::has_flag(self.flags(), flags::FIN)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.raw_type())
            .field("length", &self.length())
            .field("flags", &self.flags())
            .field("stream_id", &self.stream_id())
            .finish()
    }
}
