//! Session: many streams over one connection.
//!
//! A session splits its connection into a read half, driven by one read-loop
//! task that decodes and dispatches every incoming frame, and a write half,
//! owned by the writer task every stream sends through.
//!
//! # Lifecycle
//!
//! 1. Wrap a connection with [`Session::client`], [`Session::server`] or a
//!    [`SessionBuilder`]
//! 2. Open streams with [`Session::open`], accept the peer's with
//!    [`Session::accept`]
//! 3. End with [`Session::close`] (GOAWAY, clean) or [`Session::kill`]
//! 4. [`Session::wait`] reports how the session ended
//!
//! # Example
//!
//! ```ignore
//! let session = Session::client(tcp_stream);
//! let stream = session.open()?;
//! stream.write(b"hello").await?;
//!
//! session.close();
//! let termination = session.wait().await;
//! assert_eq!(termination.code, ErrorCode::NoError);
//! ```

mod builder;
mod table;

#[cfg(test)]
mod tests;

pub use builder::SessionBuilder;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::config::SessionConfig;
use crate::error::{MuxError, Result};
use crate::extension::{Extension, ExtensionRegistry};
use crate::listener::SessionListener;
use crate::protocol::{
    ErrorCode, Frame, FrameKind, FrameReader, FrameType, GoAway, StreamId, StreamPriority,
    StreamRst, StreamSyn, StreamType, DEFAULT_STREAM_TYPE, MAX_FRAME_PAYLOAD,
    MIN_EXTENSION_STREAM_TYPE, STREAM_ID_MASK,
};
use crate::stream::{MuxStream, Stream, StreamFactory, StreamParams};
use crate::writer::{spawn_writer_task, WriterHandle};

use table::StreamTable;

/// How a session ended.
#[derive(Debug, Clone)]
pub struct Termination {
    /// Termination code; `NoError` for a clean shutdown.
    pub code: ErrorCode,
    /// What caused it.
    pub error: MuxError,
    /// The peer's GOAWAY, if one arrived first.
    pub remote_go_away: Option<GoAway>,
}

/// Coarse session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// This side sent GOAWAY; existing streams continue.
    Closing,
    Closed,
}

/// The part of a session a stream can reach.
pub(crate) trait SessionLink: Send + Sync {
    fn release_stream(&self, id: StreamId, reset_locally: bool);
}

/// A stream's handle on its session.
///
/// Holds the session weakly, so streams never keep a dead session alive.
#[derive(Clone)]
pub struct SessionHandle {
    link: Weak<dyn SessionLink>,
    writer: WriterHandle,
}

impl SessionHandle {
    /// Writer shared by every stream of the session.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Remove a stream from the session's table. `reset_locally` marks ids
    /// this side reset, whose late frames are then dropped without reply.
    pub fn release_stream(&self, id: StreamId, reset_locally: bool) {
        if let Some(link) = self.link.upgrade() {
            link.release_stream(id, reset_locally);
        }
    }

    /// A handle attached to no session, for exercising streams alone.
    #[cfg(test)]
    pub(crate) fn detached(writer: WriterHandle) -> Self {
        struct Detached;
        impl SessionLink for Detached {
            fn release_stream(&self, _id: StreamId, _reset_locally: bool) {}
        }
        let link: Weak<dyn SessionLink> = Weak::<Detached>::new();
        Self { link, writer }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("attached", &(self.link.strong_count() > 0))
            .finish()
    }
}

struct RemoteIds {
    /// Highest stream id the peer has opened.
    last_id: StreamId,
    /// GOAWAY sent; further peer SYNs are refused.
    go_away_sent: bool,
}

struct SessionInner<S: MuxStream> {
    is_client: bool,
    config: SessionConfig,
    factory: StreamFactory<S>,
    handle: SessionHandle,
    writer: WriterHandle,
    streams: StreamTable<S>,
    /// `None` once this side's ids are used up.
    next_local_id: Mutex<Option<StreamId>>,
    remote: Mutex<RemoteIds>,
    remote_go_away: Mutex<Option<GoAway>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<S>>>,
    termination: watch::Sender<Option<Termination>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `id` has the parity this side allocates.
fn is_local_id(is_client: bool, id: StreamId) -> bool {
    (id % 2 == 1) == is_client
}

impl<S: MuxStream> SessionLink for SessionInner<S> {
    fn release_stream(&self, id: StreamId, reset_locally: bool) {
        self.streams.remove(id, reset_locally);
    }
}

impl<S: MuxStream> SessionInner<S> {
    fn termination_code(&self) -> Option<ErrorCode> {
        self.termination.borrow().as_ref().map(|t| t.code)
    }

    fn closed_error(&self) -> MuxError {
        MuxError::SessionClosed(self.termination_code().unwrap_or(ErrorCode::InternalError))
    }

    fn send_rst(&self, id: StreamId, code: ErrorCode) {
        let sent = StreamRst::new(id, code)
            .encode()
            .and_then(|frame| self.writer.send(frame));
        if let Err(e) = sent {
            tracing::debug!("Could not send RST for stream {}: {}", id, e);
        }
    }

    /// Terminate the session. Only the first call has any effect.
    fn die(&self, code: ErrorCode, error: MuxError, send_go_away: bool) {
        let termination = Termination {
            code,
            error: error.clone(),
            remote_go_away: lock(&self.remote_go_away).clone(),
        };
        let first = self.termination.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(termination);
            true
        });
        if !first {
            return;
        }

        match code {
            ErrorCode::NoError | ErrorCode::Cancel => {
                tracing::debug!("Session terminated with {}: {}", code, error)
            }
            _ => tracing::warn!("Session terminated with {}: {}", code, error),
        }

        if send_go_away {
            let debug = if code == ErrorCode::NoError {
                Bytes::new()
            } else {
                let mut message = error.to_string().into_bytes();
                message.truncate(MAX_FRAME_PAYLOAD - 8);
                Bytes::from(message)
            };
            let last_id = lock(&self.remote).last_id;
            let sent = GoAway::new(last_id, code, debug)
                .encode()
                .and_then(|frame| self.writer.send(frame));
            if let Err(e) = sent {
                tracing::debug!("Could not send GOAWAY: {}", e);
            }
        }

        self.writer.shutdown();

        for stream in self.streams.drain() {
            stream.close_with(MuxError::SessionClosed(code));
        }
    }
}

/// A multiplexed session over one connection.
///
/// Cheap to clone; clones share the same session. Dropping the last clone
/// kills the session (code `Cancel`, no GOAWAY), failing any streams still
/// in use. Call [`Session::close`] first for a clean shutdown.
pub struct Session<S: MuxStream = Stream> {
    inner: Arc<SessionInner<S>>,
    owner: Arc<Owner<S>>,
}

impl<S: MuxStream> Clone for Session<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// Shared by every user-facing [`Session`] clone. The read loop and the
/// writer watcher hold the session state directly, not through this.
struct Owner<S: MuxStream> {
    inner: Weak<SessionInner<S>>,
}

impl<S: MuxStream> Drop for Owner<S> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.termination_code().is_none() {
                tracing::debug!("Last session handle dropped, killing session");
            }
            inner.die(
                ErrorCode::Cancel,
                MuxError::SessionClosed(ErrorCode::Cancel),
                false,
            );
        }
    }
}

impl Session<Stream> {
    /// Client side session with default settings. Opens odd stream ids.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn client<C>(conn: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().client().start(conn)
    }

    /// Server side session with default settings. Opens even stream ids.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn server<C>(conn: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().server().start(conn)
    }

    pub fn builder() -> SessionBuilder<Stream> {
        SessionBuilder::new()
    }
}

impl<S: MuxStream> Session<S> {
    /// Wrap `conn` with a custom stream factory and extensions, using the
    /// default configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<C>(
        conn: C,
        factory: StreamFactory<S>,
        is_client: bool,
        extensions: Vec<Arc<dyn Extension<S>>>,
    ) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(
            conn,
            factory,
            is_client,
            SessionConfig::default(),
            extensions,
            (None, None),
        )
    }

    pub(crate) fn start<C>(
        conn: C,
        factory: StreamFactory<S>,
        is_client: bool,
        config: SessionConfig,
        extensions: Vec<Arc<dyn Extension<S>>>,
        (local_addr, remote_addr): (Option<SocketAddr>, Option<SocketAddr>),
    ) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        // 1. Split the connection
        let (read_half, write_half) = tokio::io::split(conn);

        // 2. Writer task owns the write half
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());

        // 3. Shared state
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (termination, _) = watch::channel(None);
        let first_local_id = if is_client { 1 } else { 2 };
        let reset_memory = config.reset_memory;
        let read_buffer_size = config.read_buffer_size;
        let backlog = config.accept_backlog;

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner<S>>| {
            let link: Weak<dyn SessionLink> = weak.clone();
            SessionInner {
                is_client,
                config,
                factory,
                handle: SessionHandle {
                    link,
                    writer: writer.clone(),
                },
                writer,
                streams: StreamTable::new(reset_memory),
                next_local_id: Mutex::new(Some(first_local_id)),
                remote: Mutex::new(RemoteIds {
                    last_id: 0,
                    go_away_sent: false,
                }),
                remote_go_away: Mutex::new(None),
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                termination,
                local_addr,
                remote_addr,
            }
        });
        let owner = Arc::new(Owner {
            inner: Arc::downgrade(&inner),
        });
        let session = Session { inner, owner };

        // 4. Extensions, before any frame is read
        let mut registry = ExtensionRegistry::new();
        for extension in extensions {
            registry.register(extension, &session, backlog);
        }

        // 5. Read loop
        let dispatcher = Dispatcher {
            inner: session.inner.clone(),
            accept_tx,
            extensions: registry,
        };
        let reader = FrameReader::with_buffer_size(read_half, read_buffer_size);
        tokio::spawn(dispatcher.run(reader));

        // 6. A failed writer takes the session down with it
        let watched = session.inner.clone();
        tokio::spawn(async move {
            let err = match writer_task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(e) => MuxError::from(io::Error::new(io::ErrorKind::Other, e.to_string())),
            };
            tracing::error!("Writer task failed: {}", err);
            watched.die(ErrorCode::InternalError, err, false);
        });

        tracing::debug!(
            "Session started as {}",
            if is_client { "client" } else { "server" }
        );
        session
    }

    /// Open a stream of the default type.
    pub fn open(&self) -> Result<Arc<S>> {
        self.open_stream(None, None, false)
    }

    /// Open a stream, sending SYN immediately.
    ///
    /// The stream is usable at once; the peer does not acknowledge SYNs.
    /// With `fin` the local side starts half-closed.
    pub fn open_stream(
        &self,
        priority: Option<StreamPriority>,
        stream_type: Option<StreamType>,
        fin: bool,
    ) -> Result<Arc<S>> {
        let inner = &self.inner;
        if inner.termination_code().is_some() {
            return Err(inner.closed_error());
        }
        if lock(&inner.remote_go_away).is_some() {
            return Err(MuxError::RemoteGoneAway);
        }

        // held until the SYN is queued, so SYNs leave in id order
        let mut next_id = lock(&inner.next_local_id);
        let id = next_id.ok_or(MuxError::StreamIdsExhausted)?;

        let syn = StreamSyn {
            stream_id: id,
            priority,
            stream_type,
            fin,
        }
        .encode()?;

        let stream = (inner.factory)(
            StreamParams {
                id,
                priority: priority.unwrap_or(0),
                stream_type: stream_type.unwrap_or(DEFAULT_STREAM_TYPE),
                fin_local: fin,
                fin_remote: false,
                window_size: inner.config.window_size,
            },
            inner.handle.clone(),
        );
        inner.streams.insert(id, stream.clone());

        if let Err(e) = inner.writer.send(syn) {
            inner.streams.remove(id, false);
            return Err(match e {
                MuxError::ConnectionClosed => inner.closed_error(),
                other => other,
            });
        }

        *next_id = id.checked_add(2).filter(|next| *next <= STREAM_ID_MASK);
        tracing::trace!("Opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Concurrent callers are served in arrival order. Fails with
    /// [`MuxError::SessionClosed`] once the session ends.
    pub async fn accept(&self) -> Result<Arc<S>> {
        let mut termination = self.inner.termination.subscribe();
        let stream = tokio::select! {
            biased;
            _ = termination.wait_for(Option::is_some) => None,
            stream = async { self.inner.accept_rx.lock().await.recv().await } => stream,
        };
        stream.ok_or_else(|| self.inner.closed_error())
    }

    /// Send GOAWAY(`NoError`) and end the session.
    pub fn close(&self) {
        self.inner.die(
            ErrorCode::NoError,
            MuxError::SessionClosed(ErrorCode::NoError),
            true,
        );
    }

    /// End the session at once, without GOAWAY.
    pub fn kill(&self) {
        self.inner.die(
            ErrorCode::Cancel,
            MuxError::SessionClosed(ErrorCode::Cancel),
            false,
        );
    }

    /// Tell the peer no more of its streams will be accepted.
    ///
    /// Streams the peer already opened continue; later SYNs are refused
    /// with RST `REFUSED_STREAM`. The session stays up.
    pub fn go_away(&self, code: ErrorCode, debug: &[u8]) -> Result<()> {
        if self.inner.termination_code().is_some() {
            return Err(self.inner.closed_error());
        }

        let mut remote = lock(&self.inner.remote);
        remote.go_away_sent = true;
        let frame = GoAway::new(remote.last_id, code, Bytes::copy_from_slice(debug)).encode()?;
        self.inner.writer.send(frame)?;
        tracing::debug!("Sent GOAWAY with {}, last stream {}", code, remote.last_id);
        Ok(())
    }

    /// Wait for the session to end.
    pub async fn wait(&self) -> Termination {
        let mut rx = self.inner.termination.subscribe();
        let termination = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|t| t.clone());
        termination.unwrap_or_else(|| Termination {
            code: ErrorCode::InternalError,
            error: MuxError::ConnectionClosed,
            remote_go_away: None,
        })
    }

    /// How the session ended, if it has.
    pub fn termination(&self) -> Option<Termination> {
        self.inner.termination.borrow().clone()
    }

    /// Adapter yielding accepted streams as connections.
    pub fn listener(&self) -> SessionListener<S> {
        SessionListener::new(self.clone())
    }

    /// The peer's GOAWAY, if one has arrived.
    pub fn remote_go_away(&self) -> Option<GoAway> {
        lock(&self.inner.remote_go_away).clone()
    }

    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn contains_stream(&self, id: StreamId) -> bool {
        self.inner.streams.contains(id)
    }

    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    pub fn is_closed(&self) -> bool {
        self.inner.termination_code().is_some()
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if lock(&self.inner.remote).go_away_sent {
            SessionState::Closing
        } else {
            SessionState::Active
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub(crate) fn termination_receiver(&self) -> watch::Receiver<Option<Termination>> {
        self.inner.termination.subscribe()
    }
}

impl<S: MuxStream> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("is_client", &self.inner.is_client)
            .field("streams", &self.inner.streams.len())
            .field("state", &self.state())
            .finish()
    }
}

/// State owned by the read loop.
struct Dispatcher<S: MuxStream> {
    inner: Arc<SessionInner<S>>,
    accept_tx: mpsc::Sender<Arc<S>>,
    extensions: ExtensionRegistry<S>,
}

impl<S: MuxStream> Dispatcher<S> {
    /// Main read loop - reads frames and dispatches them until the session dies.
    async fn run<R: AsyncRead + Unpin>(self, mut reader: FrameReader<R>) {
        let mut termination = self.inner.termination.subscribe();

        loop {
            let frame = tokio::select! {
                biased;
                _ = termination.wait_for(Option::is_some) => return,
                frame = reader.read_frame() => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    let code = lock(&self.inner.remote_go_away)
                        .as_ref()
                        .map_or(ErrorCode::InternalError, |g| g.error_code);
                    if !matches!(err, MuxError::ConnectionClosed) {
                        tracing::error!("Read loop error: {}", err);
                    }
                    self.inner.die(code, err, false);
                    return;
                }
            };

            if let Err(err) = self.handle_frame(frame) {
                tracing::warn!("Peer violated protocol: {}", err);
                self.inner.die(ErrorCode::ProtocolError, err, true);
                return;
            }
        }
    }

    /// Dispatch one frame. An error is fatal to the session.
    fn handle_frame(&self, frame: Frame) -> Result<()> {
        let header = frame.header;

        let kind = match frame.classify() {
            Ok(kind) => kind,
            Err(err) => return self.handle_malformed(header.frame_type(), header.stream_id(), err),
        };

        match kind {
            FrameKind::Syn(syn) => self.handle_syn(syn)?,
            FrameKind::Data(data) => match self.inner.streams.get(data.stream_id) {
                Some(stream) => stream.handle_stream_data(data),
                None if self.inner.streams.was_reset_locally(data.stream_id) => {
                    tracing::trace!("Dropping late DATA for reset stream {}", data.stream_id);
                }
                None => {
                    tracing::debug!("DATA for unknown stream {}", data.stream_id);
                    self.inner.send_rst(data.stream_id, ErrorCode::StreamClosed);
                }
            },
            FrameKind::WndInc(inc) => {
                if let Some(stream) = self.inner.streams.get(inc.stream_id) {
                    stream.handle_stream_wnd_inc(inc);
                }
            }
            FrameKind::Rst(rst) => {
                if let Some(stream) = self.inner.streams.get(rst.stream_id) {
                    stream.handle_stream_rst(rst);
                }
            }
            FrameKind::GoAway(go_away) => self.handle_go_away(go_away),
            FrameKind::Other(frame) => self.extensions.dispatch_frame(frame),
        }
        Ok(())
    }

    /// Bad SYN or GOAWAY payloads are fatal; bad RST or WND_INC payloads
    /// reset only the addressed stream.
    fn handle_malformed(
        &self,
        frame_type: Option<FrameType>,
        id: StreamId,
        err: MuxError,
    ) -> Result<()> {
        match frame_type {
            Some(FrameType::StreamRst) | Some(FrameType::StreamWndInc) => {
                if let Some(stream) = self.inner.streams.get(id) {
                    tracing::warn!("Resetting stream {}: {}", id, err);
                    self.inner.send_rst(id, ErrorCode::FrameSizeError);
                    self.inner.streams.remove(id, true);
                    stream.close_with(err);
                }
                Ok(())
            }
            _ => Err(err),
        }
    }

    fn handle_syn(&self, syn: StreamSyn) -> Result<()> {
        let inner = &self.inner;
        let id = syn.stream_id;

        if is_local_id(inner.is_client, id) {
            return Err(MuxError::Protocol(format!(
                "{} opened stream {} with the wrong id parity",
                if inner.is_client { "server" } else { "client" },
                id
            )));
        }

        {
            let mut remote = lock(&inner.remote);
            if id <= remote.last_id {
                return Err(MuxError::Protocol(format!(
                    "stream id {} is not greater than the last remote id {}",
                    id, remote.last_id
                )));
            }
            remote.last_id = id;

            if remote.go_away_sent {
                drop(remote);
                tracing::debug!("Refusing stream {} after GOAWAY", id);
                inner.send_rst(id, ErrorCode::RefusedStream);
                return Ok(());
            }
        }

        let stream_type = syn.stream_type.unwrap_or(DEFAULT_STREAM_TYPE);
        let queue = if stream_type < MIN_EXTENSION_STREAM_TYPE {
            &self.accept_tx
        } else if let Some(queue) = self.extensions.accept_queue(stream_type) {
            queue
        } else {
            tracing::debug!("Refusing stream {} of unknown extension type {:#x}", id, stream_type);
            inner.send_rst(id, ErrorCode::RefusedStream);
            return Ok(());
        };

        let stream = (inner.factory)(
            StreamParams {
                id,
                priority: syn.priority.unwrap_or(0),
                stream_type,
                fin_local: false,
                fin_remote: syn.fin,
                window_size: inner.config.window_size,
            },
            inner.handle.clone(),
        );
        inner.streams.insert(id, stream.clone());

        if queue.try_send(stream).is_err() {
            tracing::warn!("Accept backlog full, refusing stream {}", id);
            inner.streams.remove(id, true);
            inner.send_rst(id, ErrorCode::RefusedStream);
        } else {
            tracing::trace!("Accepted stream {}", id);
        }
        Ok(())
    }

    fn handle_go_away(&self, go_away: GoAway) {
        tracing::debug!(
            "Peer sent GOAWAY with {}, last stream {}",
            go_away.error_code,
            go_away.last_stream_id
        );
        let last_id = go_away.last_stream_id;
        *lock(&self.inner.remote_go_away) = Some(go_away);

        let is_client = self.inner.is_client;
        let orphaned = self
            .inner
            .streams
            .remove_where(|id| is_local_id(is_client, id) && id > last_id);
        for stream in orphaned {
            stream.close_with(MuxError::RemoteGoneAway);
        }
    }
}
