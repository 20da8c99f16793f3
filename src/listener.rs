//! Accepted streams as plain async connections.
//!
//! [`SessionListener`] turns a session into something connection-oriented
//! server code can drive: every accepted stream comes back as a
//! [`StreamConn`] implementing [`AsyncRead`] and [`AsyncWrite`].
//!
//! ```ignore
//! let listener = session.listener();
//! loop {
//!     let mut conn = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut buf = Vec::new();
//!         conn.read_to_end(&mut buf).await?;
//!         conn.write_all(&buf).await?;
//!         conn.shutdown().await
//!     });
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::MuxError;
use crate::protocol::StreamId;
use crate::session::Session;
use crate::stream::{MuxStream, Stream};

/// Accepts the peer's streams as connections.
pub struct SessionListener<S: MuxStream = Stream> {
    session: Session<S>,
}

impl<S: MuxStream> Clone for SessionListener<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<S: MuxStream> std::fmt::Debug for SessionListener<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionListener")
            .field("session", &self.session)
            .finish()
    }
}

impl<S: MuxStream> SessionListener<S> {
    pub(crate) fn new(session: Session<S>) -> Self {
        Self { session }
    }

    /// Wait for the next stream. Fails once the session has ended.
    pub async fn accept(&self) -> io::Result<StreamConn<S>> {
        let stream = self.session.accept().await?;
        Ok(StreamConn {
            stream,
            local_addr: self.session.local_addr(),
            remote_addr: self.session.remote_addr(),
            shut_down: false,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.local_addr()
    }

    /// End the underlying session.
    pub fn close(&self) {
        self.session.close();
    }
}

/// One stream seen as a connection.
///
/// `poll_shutdown` half-closes the stream; dropping the connection closes it.
pub struct StreamConn<S: MuxStream = Stream> {
    stream: Arc<S>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    shut_down: bool,
}

impl<S: MuxStream> StreamConn<S> {
    pub fn id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn stream(&self) -> &Arc<S> {
        &self.stream
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl<S: MuxStream> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stream.poll_read(cx, buf).map_err(io::Error::from)
    }
}

impl<S: MuxStream> AsyncWrite for StreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.stream.poll_write(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are handed to the writer task as soon as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shut_down {
            return Poll::Ready(Ok(()));
        }
        match ready!(this.stream.poll_half_close(cx, &[])) {
            Ok(_) | Err(MuxError::StreamClosed) => {
                this.shut_down = true;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl<S: MuxStream> Drop for StreamConn<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.close() {
            tracing::debug!("Error closing stream {}: {}", self.stream.id(), e);
        }
    }
}

impl<S: MuxStream> std::fmt::Debug for StreamConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("id", &self.stream.id())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
