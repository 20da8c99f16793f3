//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol:
//! - 8-byte header encoding/decoding
//! - Frame buffer and reader for turning a byte stream into frames
//! - Typed frame kinds and error codes

mod frame;
mod frame_buffer;
mod header;

pub use frame::{
    ErrorCode, Frame, FrameKind, GoAway, StreamData, StreamPriority, StreamRst, StreamSyn,
    StreamType, StreamWndInc, DEFAULT_STREAM_TYPE, FIRST_APPLICATION_CODE,
    MIN_EXTENSION_STREAM_TYPE,
};
pub use frame_buffer::{FrameBuffer, FrameReader, DEFAULT_READ_BUFFER_SIZE};
pub use header::{
    flags, FrameType, Header, StreamId, HEADER_SIZE, LENGTH_MASK, MAX_FRAME_PAYLOAD,
    MIN_EXTENSION_FRAME_TYPE, STREAM_ID_MASK, TYPE_MASK,
};
