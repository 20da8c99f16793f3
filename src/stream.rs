//! Logical streams multiplexed over a session.
//!
//! [`MuxStream`] is the capability set the session relies on: the read loop
//! feeds frames in through the `handle_*` methods, and applications move
//! bytes through the `poll_*` methods. [`Stream`] is the production
//! implementation; tests and embedders can supply their own through a
//! [`StreamFactory`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──data──► Open ──FIN sent──► HalfClosedLocal  ──FIN received──► Closed
//!                     ──FIN recv──► HalfClosedRemote ──FIN sent─────► Closed
//! any state ──RST sent/received, close(), session death──► Reset
//! ```
//!
//! # Example
//!
//! ```ignore
//! let stream = session.open()?;
//! stream.write(b"ping").await?;
//! stream.half_close(b"").await?;
//!
//! let mut buf = [0u8; 4];
//! let n = stream.read(&mut buf).await?;
//! ```

use std::future::{poll_fn, Future};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio::io::ReadBuf;
use tokio::time::Instant;

use crate::error::{MuxError, Result};
use crate::flow_control::{RecvWindow, SendWindow};
use crate::protocol::{
    ErrorCode, StreamData, StreamId, StreamPriority, StreamRst, StreamType, StreamWndInc,
    MAX_FRAME_PAYLOAD,
};
use crate::session::SessionHandle;
use crate::writer::WriterHandle;

/// Everything a factory needs to build a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub id: StreamId,
    pub priority: StreamPriority,
    pub stream_type: StreamType,
    /// Local side starts half-closed (opened with FIN).
    pub fin_local: bool,
    /// Remote side starts half-closed (SYN carried FIN).
    pub fin_remote: bool,
    /// Initial send and receive window.
    pub window_size: u32,
}

/// Builds the stream object for a newly opened or accepted stream id.
pub type StreamFactory<S> = Arc<dyn Fn(StreamParams, SessionHandle) -> Arc<S> + Send + Sync>;

/// Operations the session needs from a stream implementation.
///
/// The `handle_*` methods are called only from the session's read loop, in
/// wire order. Everything else may be called concurrently from any task.
pub trait MuxStream: Send + Sync + 'static {
    fn id(&self) -> StreamId;

    fn stream_type(&self) -> StreamType;

    /// Read buffered stream bytes. Filling nothing signals EOF.
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>>;

    /// Send bytes, bounded by the send window and the frame size.
    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>>;

    /// Send bytes and FIN.
    ///
    /// FIN goes out on the frame carrying the last byte of `trailer`; the
    /// stream is half-closed locally only once the returned count equals
    /// `trailer.len()`. An empty trailer sends an empty FIN frame.
    fn poll_half_close(&self, cx: &mut Context<'_>, trailer: &[u8]) -> Poll<Result<usize>>;

    /// Abort the stream (RST `Cancel`) unless it already closed cleanly.
    fn close(&self) -> Result<()>;

    fn handle_stream_data(&self, frame: StreamData);

    fn handle_stream_wnd_inc(&self, frame: StreamWndInc);

    fn handle_stream_rst(&self, frame: StreamRst);

    /// Fail every pending and future operation with `err`. Sends nothing.
    fn close_with(&self, err: MuxError);
}

/// Observable lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

struct Inner {
    recv_buf: BytesMut,
    recv_window: RecvWindow,
    send_window: SendWindow,
    fin_local: bool,
    fin_remote: bool,
    data_seen: bool,
    fault: Option<MuxError>,
    readers: Wakers,
    writers: Wakers,
}

/// Tasks parked on one direction of a stream. Waking drains all of them.
#[derive(Default)]
struct Wakers(Vec<Waker>);

impl Wakers {
    fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    fn wake(&mut self) {
        for waker in self.0.drain(..) {
            waker.wake();
        }
    }
}

impl Inner {
    fn wake_all(&mut self) {
        self.readers.wake();
        self.writers.wake();
    }

    fn fully_closed(&self) -> bool {
        self.fin_local && self.fin_remote
    }
}

#[derive(Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

/// Production stream implementation.
pub struct Stream {
    id: StreamId,
    priority: StreamPriority,
    stream_type: StreamType,
    session: SessionHandle,
    writer: WriterHandle,
    inner: Mutex<Inner>,
    deadlines: Mutex<Deadlines>,
}

impl Stream {
    pub fn new(params: StreamParams, session: SessionHandle) -> Self {
        let writer = session.writer().clone();
        Self {
            id: params.id,
            priority: params.priority,
            stream_type: params.stream_type,
            session,
            writer,
            inner: Mutex::new(Inner {
                recv_buf: BytesMut::new(),
                recv_window: RecvWindow::new(params.window_size),
                send_window: SendWindow::new(params.window_size),
                fin_local: params.fin_local,
                fin_remote: params.fin_remote,
                data_seen: false,
                fault: None,
                readers: Wakers::default(),
                writers: Wakers::default(),
            }),
            deadlines: Mutex::new(Deadlines::default()),
        }
    }

    /// The default factory used by sessions.
    pub fn factory() -> StreamFactory<Stream> {
        Arc::new(|params, session| Arc::new(Stream::new(params, session)))
    }

    #[inline]
    pub fn priority(&self) -> StreamPriority {
        self.priority
    }

    /// Handle of the session this stream belongs to.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn state(&self) -> StreamState {
        let inner = self.lock();
        if inner.fault.is_some() {
            return StreamState::Reset;
        }
        match (inner.fin_local, inner.fin_remote) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) if inner.data_seen => StreamState::Open,
            (false, false) => StreamState::Idle,
        }
    }

    /// Current send credit.
    pub fn send_window(&self) -> u32 {
        self.lock().send_window.available()
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means the peer half-closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = self.deadlines().read;
        with_deadline(
            deadline,
            poll_fn(|cx| {
                let mut read_buf = ReadBuf::new(buf);
                match self.poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                }
            }),
        )
        .await
    }

    /// Write all of `buf`, waiting for window credit as needed.
    ///
    /// On timeout or reset some prefix of `buf` may already have been sent.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let deadline = self.deadlines().write;
        with_deadline(deadline, async {
            let mut written = 0;
            while written < buf.len() {
                written += poll_fn(|cx| self.poll_write(cx, &buf[written..])).await?;
            }
            Ok(written)
        })
        .await
    }

    /// Write `trailer` and half-close the local side.
    pub async fn half_close(&self, trailer: &[u8]) -> Result<usize> {
        let deadline = self.deadlines().write;
        with_deadline(deadline, async {
            let mut written = 0;
            loop {
                written += poll_fn(|cx| self.poll_half_close(cx, &trailer[written..])).await?;
                if written == trailer.len() {
                    return Ok(written);
                }
            }
        })
        .await
    }

    /// Abort the stream with an application chosen code.
    ///
    /// `Other` values that collide with a named code are reported locally as
    /// that code, matching what the peer sees.
    pub fn reset(&self, code: ErrorCode) {
        let code = code.normalize();
        self.reset_with(code, MuxError::StreamReset(code));
    }

    /// Send RST with `code`, fail local operations with `err`, and forget the stream.
    ///
    /// Frames for this id still in flight from the peer are dropped silently.
    pub(crate) fn reset_with(&self, code: ErrorCode, err: MuxError) {
        {
            let mut inner = self.lock();
            if inner.fault.is_some() {
                return;
            }
            tracing::debug!("Resetting stream {} with {}: {}", self.id, code, err);
            inner.fault = Some(err);
            inner.recv_buf.clear();
            inner.wake_all();
            self.send_rst(code);
        }
        self.session.release_stream(self.id, true);
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut deadlines = self.deadlines_mut();
        deadlines.read = deadline;
        deadlines.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines_mut().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines_mut().write = deadline;
    }

    fn send_rst(&self, code: ErrorCode) {
        let sent = StreamRst::new(self.id, code)
            .encode()
            .and_then(|frame| self.writer.send(frame));
        if let Err(e) = sent {
            tracing::debug!("Could not send RST for stream {}: {}", self.id, e);
        }
    }

    /// Queue one DATA frame. Caller holds the state lock so frames keep order.
    fn send_data(&self, data: &[u8], fin: bool) -> Result<()> {
        let frame = StreamData::new(self.id, Bytes::copy_from_slice(data), fin).encode()?;
        self.writer.send(frame)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deadlines(&self) -> Deadlines {
        *self.deadlines_mut()
    }

    fn deadlines_mut(&self) -> MutexGuard<'_, Deadlines> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .unwrap_or(Err(MuxError::Timeout)),
    }
}

impl MuxStream for Stream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>> {
        let mut inner = self.lock();

        if let Some(err) = &inner.fault {
            return Poll::Ready(Err(err.clone()));
        }

        if !inner.recv_buf.is_empty() {
            let n = buf.remaining().min(inner.recv_buf.len());
            let chunk = inner.recv_buf.split_to(n);
            buf.put_slice(&chunk);

            // no credit is owed once the peer has finished sending
            if !inner.fin_remote {
                if let Some(increment) = inner.recv_window.consume(n) {
                    let sent = StreamWndInc::new(self.id, increment)
                        .encode()
                        .and_then(|frame| self.writer.send(frame));
                    if let Err(e) = sent {
                        tracing::debug!("Could not send WND_INC for stream {}: {}", self.id, e);
                    }
                }
            }
            return Poll::Ready(Ok(()));
        }

        if inner.fin_remote || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        inner.readers.register(cx.waker());
        Poll::Pending
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let mut inner = self.lock();

        if let Some(err) = &inner.fault {
            return Poll::Ready(Err(err.clone()));
        }
        if inner.fin_local {
            return Poll::Ready(Err(MuxError::StreamClosed));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if inner.send_window.is_exhausted() {
            inner.writers.register(cx.waker());
            return Poll::Pending;
        }

        let n = inner.send_window.reserve(buf.len().min(MAX_FRAME_PAYLOAD));
        self.send_data(&buf[..n], false)?;
        inner.data_seen = true;
        Poll::Ready(Ok(n))
    }

    fn poll_half_close(&self, cx: &mut Context<'_>, trailer: &[u8]) -> Poll<Result<usize>> {
        let finished = {
            let mut inner = self.lock();

            if let Some(err) = &inner.fault {
                return Poll::Ready(Err(err.clone()));
            }
            if inner.fin_local {
                return Poll::Ready(Err(MuxError::StreamClosed));
            }

            let n = if trailer.is_empty() {
                0
            } else if inner.send_window.is_exhausted() {
                inner.writers.register(cx.waker());
                return Poll::Pending;
            } else {
                inner
                    .send_window
                    .reserve(trailer.len().min(MAX_FRAME_PAYLOAD))
            };

            let fin = n == trailer.len();
            self.send_data(&trailer[..n], fin)?;
            if n > 0 {
                inner.data_seen = true;
            }
            if !fin {
                return Poll::Ready(Ok(n));
            }

            inner.fin_local = true;
            inner.wake_all();
            (n, inner.fully_closed())
        };

        let (n, fully_closed) = finished;
        if fully_closed {
            tracing::trace!("Stream {} closed by both sides", self.id);
            self.session.release_stream(self.id, false);
        }
        Poll::Ready(Ok(n))
    }

    fn close(&self) -> Result<()> {
        let reset_locally = {
            let mut inner = self.lock();
            match inner.fault {
                Some(_) => false,
                None if inner.fully_closed() => {
                    inner.fault = Some(MuxError::StreamClosed);
                    false
                }
                None => {
                    inner.fault = Some(MuxError::StreamClosed);
                    inner.recv_buf.clear();
                    inner.wake_all();
                    self.send_rst(ErrorCode::Cancel);
                    true
                }
            }
        };
        self.session.release_stream(self.id, reset_locally);
        Ok(())
    }

    fn handle_stream_data(&self, frame: StreamData) {
        let violation = {
            let mut inner = self.lock();
            if inner.fault.is_some() {
                return;
            }

            if inner.fin_remote {
                Some((ErrorCode::StreamClosed, MuxError::StreamClosed))
            } else if !inner.recv_window.accept(frame.data.len()) {
                Some((
                    ErrorCode::FlowControlError,
                    MuxError::FlowControl {
                        stream_id: self.id,
                        len: frame.data.len(),
                        window: inner.recv_window.available(),
                    },
                ))
            } else {
                inner.recv_buf.extend_from_slice(&frame.data);
                inner.data_seen = true;
                if frame.fin {
                    inner.fin_remote = true;
                }
                inner.readers.wake();
                if inner.fully_closed() {
                    drop(inner);
                    tracing::trace!("Stream {} closed by both sides", self.id);
                    self.session.release_stream(self.id, false);
                }
                None
            }
        };

        if let Some((code, err)) = violation {
            tracing::warn!("Stream {} violated protocol: {}", self.id, err);
            self.reset_with(code, err);
        }
    }

    fn handle_stream_wnd_inc(&self, frame: StreamWndInc) {
        let overflow = {
            let mut inner = self.lock();
            if inner.fault.is_some() {
                return;
            }
            if inner.send_window.increase(frame.increment) {
                inner.writers.wake();
                false
            } else {
                true
            }
        };

        if overflow {
            self.reset_with(
                ErrorCode::FlowControlError,
                MuxError::Protocol(format!(
                    "window increment of {} overflows stream {}",
                    frame.increment, self.id
                )),
            );
        }
    }

    fn handle_stream_rst(&self, frame: StreamRst) {
        {
            let mut inner = self.lock();
            if inner.fault.is_some() {
                return;
            }
            tracing::debug!("Stream {} reset by peer: {}", self.id, frame.error_code);
            inner.fault = Some(MuxError::StreamReset(frame.error_code));
            inner.recv_buf.clear();
            inner.wake_all();
        }
        self.session.release_stream(self.id, false);
    }

    fn close_with(&self, err: MuxError) {
        let mut inner = self.lock();
        if inner.fault.is_none() {
            inner.fault = Some(err);
        }
        inner.wake_all();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("stream_type", &self.stream_type)
            .field("state", &self.state())
            .finish()
    }
}
