//! Frame kinds with typed accessors.
//!
//! A [`Frame`] is a decoded header plus its payload, exactly as read off the
//! wire. [`Frame::classify`] turns it into one of the typed kinds the session
//! dispatches on; the typed kinds encode themselves back into an
//! [`OutboundFrame`] for the writer task.
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{Frame, FrameKind, StreamData};
//! use bytes::Bytes;
//!
//! let out = StreamData::new(3, Bytes::from_static(b"hello"), true).encode().unwrap();
//! let frame = Frame::new(out.header, out.payload);
//!
//! match frame.classify().unwrap() {
//!     FrameKind::Data(data) => {
//!         assert_eq!(data.stream_id, 3);
//!         assert!(data.fin);
//!         assert_eq!(&data.data[..], b"hello");
//!     }
//!     other => panic!("unexpected frame {:?}", other),
//! }
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::header::{flags, FrameType, Header, StreamId, STREAM_ID_MASK};
use crate::error::{MuxError, Result};
use crate::writer::OutboundFrame;

/// Application-visible stream type carried in SYN frames.
pub type StreamType = u32;

/// Advisory stream priority carried in SYN frames.
pub type StreamPriority = u32;

/// Stream type of streams opened with [`Session::open`](crate::Session::open).
pub const DEFAULT_STREAM_TYPE: StreamType = 0;

/// First stream type reserved for extensions.
pub const MIN_EXTENSION_STREAM_TYPE: StreamType = 0xFFFF_FFFF - 0x100;

/// First error code free for application use.
pub const FIRST_APPLICATION_CODE: u32 = 0x100;

/// Error codes carried by RST and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    /// Any code without a protocol meaning.
    ///
    /// Values 0 through 7 decode as the named variants on the other side;
    /// use [`ErrorCode::normalize`] or codes from [`FIRST_APPLICATION_CODE`] up.
    Other(u32),
}

impl ErrorCode {
    /// Wire value.
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::ProtocolError => 1,
            ErrorCode::InternalError => 2,
            ErrorCode::FlowControlError => 3,
            ErrorCode::StreamClosed => 4,
            ErrorCode::FrameSizeError => 5,
            ErrorCode::RefusedStream => 6,
            ErrorCode::Cancel => 7,
            ErrorCode::Other(code) => code,
        }
    }

    /// The variant a peer decodes this code as.
    pub fn normalize(self) -> Self {
        Self::from_u32(self.as_u32())
    }

    /// Parse a wire value. Unknown values are preserved as [`ErrorCode::Other`].
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::ProtocolError,
            2 => ErrorCode::InternalError,
            3 => ErrorCode::FlowControlError,
            4 => ErrorCode::StreamClosed,
            5 => ErrorCode::FrameSizeError,
            6 => ErrorCode::RefusedStream,
            7 => ErrorCode::Cancel,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => f.write_str("NO_ERROR"),
            ErrorCode::ProtocolError => f.write_str("PROTOCOL_ERROR"),
            ErrorCode::InternalError => f.write_str("INTERNAL_ERROR"),
            ErrorCode::FlowControlError => f.write_str("FLOW_CONTROL_ERROR"),
            ErrorCode::StreamClosed => f.write_str("STREAM_CLOSED"),
            ErrorCode::FrameSizeError => f.write_str("FRAME_SIZE_ERROR"),
            ErrorCode::RefusedStream => f.write_str("REFUSED_STREAM"),
            ErrorCode::Cancel => f.write_str("CANCEL"),
            ErrorCode::Other(code) => write!(f, "ERROR_{:#x}", code),
        }
    }
}

/// A complete frame as read from the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the stream id.
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.header.stream_id()
    }

    /// Get the (masked) frame type.
    #[inline]
    pub fn raw_type(&self) -> u8 {
        self.header.raw_type()
    }

    /// Turn the frame into its typed kind.
    ///
    /// Fails with [`MuxError::Protocol`] when a control frame's payload has the
    /// wrong size. Types the session does not know are returned as
    /// [`FrameKind::Other`].
    pub fn classify(self) -> Result<FrameKind> {
        let stream_id = self.header.stream_id();
        let frame_flags = self.header.flags();

        let Some(frame_type) = self.header.frame_type() else {
            return Ok(FrameKind::Other(self));
        };

        let mut payload = self.payload;
        let kind = match frame_type {
            FrameType::StreamSyn => {
                let mut expected = 0;
                if flags::has_flag(frame_flags, flags::HAS_PRIORITY) {
                    expected += 4;
                }
                if flags::has_flag(frame_flags, flags::HAS_TYPE) {
                    expected += 4;
                }
                if payload.len() != expected {
                    return Err(malformed("STREAM_SYN", expected, payload.len()));
                }
                let priority = flags::has_flag(frame_flags, flags::HAS_PRIORITY)
                    .then(|| payload.get_u32());
                let stream_type =
                    flags::has_flag(frame_flags, flags::HAS_TYPE).then(|| payload.get_u32());
                FrameKind::Syn(StreamSyn {
                    stream_id,
                    priority,
                    stream_type,
                    fin: flags::has_flag(frame_flags, flags::FIN),
                })
            }
            FrameType::StreamData => FrameKind::Data(StreamData {
                stream_id,
                data: payload,
                fin: flags::has_flag(frame_flags, flags::FIN),
            }),
            FrameType::StreamRst => {
                if payload.len() != 4 {
                    return Err(malformed("STREAM_RST", 4, payload.len()));
                }
                FrameKind::Rst(StreamRst {
                    stream_id,
                    error_code: ErrorCode::from_u32(payload.get_u32()),
                })
            }
            FrameType::StreamWndInc => {
                if payload.len() != 4 {
                    return Err(malformed("STREAM_WND_INC", 4, payload.len()));
                }
                FrameKind::WndInc(StreamWndInc {
                    stream_id,
                    increment: payload.get_u32(),
                })
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(malformed("GOAWAY", 8, payload.len()));
                }
                let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let error_code = ErrorCode::from_u32(payload.get_u32());
                FrameKind::GoAway(GoAway {
                    last_stream_id,
                    error_code,
                    debug: payload,
                })
            }
        };
        Ok(kind)
    }
}

fn malformed(kind: &str, expected: usize, got: usize) -> MuxError {
    MuxError::Protocol(format!(
        "malformed {} frame: expected {} payload bytes, got {}",
        kind, expected, got
    ))
}

/// Typed view of a frame.
#[derive(Debug, Clone)]
pub enum FrameKind {
    Syn(StreamSyn),
    Data(StreamData),
    Rst(StreamRst),
    WndInc(StreamWndInc),
    GoAway(GoAway),
    /// Reserved or extension frame type, passed through untouched.
    Other(Frame),
}

/// STREAM_SYN: opens a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSyn {
    pub stream_id: StreamId,
    pub priority: Option<StreamPriority>,
    pub stream_type: Option<StreamType>,
    pub fin: bool,
}

impl StreamSyn {
    /// A plain SYN: default type, no priority, not half-closed.
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            priority: None,
            stream_type: None,
            fin: false,
        }
    }

    /// Encode for sending.
    pub fn encode(&self) -> Result<OutboundFrame> {
        let mut frame_flags = 0;
        let mut payload = BytesMut::with_capacity(8);
        if self.fin {
            frame_flags |= flags::FIN;
        }
        if let Some(priority) = self.priority {
            frame_flags |= flags::HAS_PRIORITY;
            payload.put_u32(priority);
        }
        if let Some(stream_type) = self.stream_type {
            frame_flags |= flags::HAS_TYPE;
            payload.put_u32(stream_type);
        }
        let header = Header::new(
            FrameType::StreamSyn.as_raw(),
            payload.len(),
            self.stream_id,
            frame_flags,
        )?;
        Ok(OutboundFrame::new(&header, payload.freeze()))
    }
}

/// STREAM_DATA: carries stream bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamData {
    pub fn new(stream_id: StreamId, data: Bytes, fin: bool) -> Self {
        Self {
            stream_id,
            data,
            fin,
        }
    }

    /// Encode for sending. Fails if `data` exceeds the frame payload limit.
    pub fn encode(&self) -> Result<OutboundFrame> {
        let frame_flags = if self.fin { flags::FIN } else { 0 };
        let header = Header::new(
            FrameType::StreamData.as_raw(),
            self.data.len(),
            self.stream_id,
            frame_flags,
        )?;
        Ok(OutboundFrame::new(&header, self.data.clone()))
    }
}

/// STREAM_RST: aborts a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRst {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl StreamRst {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn encode(&self) -> Result<OutboundFrame> {
        let header = Header::new(FrameType::StreamRst.as_raw(), 4, self.stream_id, 0)?;
        let payload = Bytes::copy_from_slice(&self.error_code.as_u32().to_be_bytes());
        Ok(OutboundFrame::new(&header, payload))
    }
}

/// STREAM_WND_INC: grants send credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWndInc {
    pub stream_id: StreamId,
    pub increment: u32,
}

impl StreamWndInc {
    pub fn new(stream_id: StreamId, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn encode(&self) -> Result<OutboundFrame> {
        let header = Header::new(FrameType::StreamWndInc.as_raw(), 4, self.stream_id, 0)?;
        let payload = Bytes::copy_from_slice(&self.increment.to_be_bytes());
        Ok(OutboundFrame::new(&header, payload))
    }
}

/// GOAWAY: the sender is shutting the session down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    /// Highest stream id the sender accepted from its peer.
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    /// Opaque diagnostic bytes.
    pub debug: Bytes,
}

impl GoAway {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug: Bytes) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug,
        }
    }

    /// Encode for sending. Fails if the debug data does not fit one frame.
    pub fn encode(&self) -> Result<OutboundFrame> {
        let header = Header::new(FrameType::GoAway.as_raw(), 8 + self.debug.len(), 0, 0)?;
        let mut payload = BytesMut::with_capacity(8 + self.debug.len());
        payload.put_u32(self.last_stream_id & STREAM_ID_MASK);
        payload.put_u32(self.error_code.as_u32());
        payload.extend_from_slice(&self.debug);
        Ok(OutboundFrame::new(&header, payload.freeze()))
    }
}
