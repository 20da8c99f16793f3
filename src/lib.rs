//! # muxwire
//!
//! Stream multiplexing over a single reliable byte connection.
//!
//! A [`Session`] wraps any `AsyncRead + AsyncWrite` connection and carries
//! many independent, flow-controlled, bidirectional [`Stream`]s over it.
//!
//! ## Architecture
//!
//! - **Wire format**: 8-byte big-endian frame header (14-bit length, 8-bit
//!   flags, 5-bit type, 31-bit stream id) followed by the payload
//! - **Session**: one read loop per connection dispatches frames to streams;
//!   one writer task serializes every outgoing frame
//! - **Streams**: per-stream send and receive windows, half-close, reset
//! - **Extensions**: sub-protocols claiming their own stream and frame types
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = tokio::net::TcpStream::connect("127.0.0.1:4001").await?;
//!     let session = Session::client(conn);
//!
//!     let stream = session.open()?;
//!     stream.write(b"hello").await?;
//!     stream.half_close(b"").await?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     session.close();
//!     session.wait().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extension;
pub mod flow_control;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod writer;

pub use config::SessionConfig;
pub use error::{MuxError, Result};
pub use extension::{ExtAccept, Extension};
pub use listener::{SessionListener, StreamConn};
pub use protocol::{ErrorCode, StreamId, StreamPriority, StreamType};
pub use session::{Session, SessionBuilder, SessionHandle, SessionState, Termination};
pub use stream::{MuxStream, Stream, StreamFactory, StreamParams, StreamState};
