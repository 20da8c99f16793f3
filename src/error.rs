//! Error types for muxwire.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{ErrorCode, StreamId};

/// Main error type for all session and stream operations.
///
/// The type is `Clone` so that a session's terminal error can be handed to
/// every caller that was blocked on it.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Frame length outside `0..=0x3FFF`.
    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    /// Stream id with the reserved top bit set.
    #[error("Invalid stream id: {0:#x}")]
    InvalidStreamId(u32),

    /// Session-level protocol violation (id parity, id reuse, malformed control frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer sent more data than the advertised receive window allowed.
    #[error("Flow control error on stream {stream_id}: {len} bytes exceeds window of {window}")]
    FlowControl {
        stream_id: StreamId,
        len: usize,
        window: u32,
    },

    /// Operation on a stream that is already closed in that direction.
    #[error("Stream closed")]
    StreamClosed,

    /// The stream was reset with the given code.
    #[error("Stream reset: {0}")]
    StreamReset(ErrorCode),

    /// The session has terminated with the given code.
    #[error("Session closed: {0}")]
    SessionClosed(ErrorCode),

    /// The peer sent GOAWAY, no new streams may be opened.
    #[error("Remote peer has gone away")]
    RemoteGoneAway,

    /// Every stream id of this side's parity has been used.
    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    /// The connection reached EOF.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline elapsed.
    #[error("Deadline exceeded")]
    Timeout,
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        MuxError::Io(Arc::new(err))
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Io(inner) => inner.kind(),
            MuxError::InvalidFrameSize(_)
            | MuxError::InvalidStreamId(_)
            | MuxError::Protocol(_)
            | MuxError::FlowControl { .. } => io::ErrorKind::InvalidData,
            MuxError::StreamClosed | MuxError::SessionClosed(_) => io::ErrorKind::BrokenPipe,
            MuxError::StreamReset(_) => io::ErrorKind::ConnectionReset,
            MuxError::RemoteGoneAway | MuxError::StreamIdsExhausted => {
                io::ErrorKind::ConnectionRefused
            }
            MuxError::ConnectionClosed => io::ErrorKind::UnexpectedEof,
            MuxError::Timeout => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, err)
    }
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;
