//! Frame buffer for accumulating partial reads, and the read half of the
//! frame transport built on it.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 8 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{FrameBuffer, StreamData};
//! use bytes::Bytes;
//!
//! let out = StreamData::new(1, Bytes::from_static(b"hi"), false).encode().unwrap();
//! let mut wire = out.header.as_bytes().to_vec();
//! wire.extend_from_slice(&out.payload);
//!
//! let mut buffer = FrameBuffer::new();
//! assert!(buffer.push(&wire[..5]).is_empty());
//! let frames = buffer.push(&wire[5..]);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].payload(), b"hi");
//! ```

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::header::{Header, HEADER_SIZE};
use super::Frame;
use crate::error::{MuxError, Result};

/// Default read chunk size for [`FrameReader`].
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header, remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// The 14-bit length field bounds every payload, so unlike a general purpose
/// framer there is no size limit to enforce here.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl FrameBuffer {
    /// Create a new frame buffer (64KB initial capacity).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER_SIZE)
    }

    /// Create a new frame buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = Header::decode(&self.buffer)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    let remaining = header.length() as usize;
                    if remaining == 0 {
                        return Some(Frame::new(header, Bytes::new()));
                    }
                    self.state = State::WaitingForPayload { header, remaining };
                }

                State::WaitingForPayload { header, remaining } => {
                    if self.buffer.len() < *remaining {
                        return None;
                    }

                    let payload = self.buffer.split_to(*remaining).freeze();
                    let header = *header;
                    self.state = State::WaitingForHeader;
                    return Some(Frame::new(header, payload));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when no partial frame is pending.
    pub fn at_frame_boundary(&self) -> bool {
        matches!(self.state, State::WaitingForHeader) && self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads whole frames from a byte stream.
///
/// Any error returned by [`read_frame`](FrameReader::read_frame) leaves the
/// reader unusable; the caller must treat it as connection loss.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, size: usize) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_capacity(size),
            ready: VecDeque::new(),
            chunk: vec![0u8; size.max(HEADER_SIZE)],
        }
    }

    /// Read the next frame.
    ///
    /// EOF between frames yields [`MuxError::ConnectionClosed`]; EOF inside a
    /// frame yields an `UnexpectedEof` I/O error.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.at_frame_boundary() {
                    return Err(MuxError::ConnectionClosed);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                )
                .into());
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n]));
        }
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
