//! Fluent construction of sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::config::SessionConfig;
use crate::extension::Extension;
use crate::stream::{MuxStream, Stream, StreamFactory};
use crate::writer::WriterConfig;

/// Builder for configuring and starting a [`Session`].
///
/// # Example
///
/// ```ignore
/// let session = SessionBuilder::new()
///     .server()
///     .window_size(256 * 1024)
///     .accept_backlog(16)
///     .extension(Arc::new(Heartbeat))
///     .start(conn);
/// ```
pub struct SessionBuilder<S: MuxStream = Stream> {
    is_client: bool,
    config: SessionConfig,
    factory: StreamFactory<S>,
    extensions: Vec<Arc<dyn Extension<S>>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl SessionBuilder<Stream> {
    /// Client role, default configuration, production streams.
    pub fn new() -> Self {
        Self::with_factory(Stream::factory())
    }
}

impl Default for SessionBuilder<Stream> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MuxStream> SessionBuilder<S> {
    /// Build sessions whose streams come from `factory`.
    pub fn with_factory(factory: StreamFactory<S>) -> Self {
        Self {
            is_client: true,
            config: SessionConfig::default(),
            factory,
            extensions: Vec::new(),
            local_addr: None,
            remote_addr: None,
        }
    }

    /// Allocate odd stream ids.
    pub fn client(mut self) -> Self {
        self.is_client = true;
        self
    }

    /// Allocate even stream ids.
    pub fn server(mut self) -> Self {
        self.is_client = false;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial flow-control window of every stream.
    pub fn window_size(mut self, size: u32) -> Self {
        self.config.window_size = size;
        self
    }

    /// Streams that may wait in each accept queue before SYNs are refused.
    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    /// Locally reset ids remembered for late-frame tolerance.
    pub fn reset_memory(mut self, ids: usize) -> Self {
        self.config.reset_memory = ids;
        self
    }

    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Register an extension. Extensions are started in registration order.
    pub fn extension(mut self, extension: Arc<dyn Extension<S>>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Addresses reported by the session and its listener's connections.
    pub fn addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    /// Wrap `conn` and spawn the session's tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<C>(self, conn: C) -> Session<S>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(
            conn,
            self.factory,
            self.is_client,
            self.config,
            self.extensions,
            (self.local_addr, self.remote_addr),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = SessionBuilder::new();
        assert!(builder.is_client);
        assert_eq!(builder.config, SessionConfig::default());
        assert!(builder.extensions.is_empty());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = SessionBuilder::default()
            .server()
            .window_size(1024)
            .accept_backlog(2)
            .reset_memory(8)
            .addrs(Some("127.0.0.1:4001".parse().unwrap()), None);

        assert!(!builder.is_client);
        assert_eq!(builder.config.window_size, 1024);
        assert_eq!(builder.config.accept_backlog, 2);
        assert_eq!(builder.config.reset_memory, 8);
        assert_eq!(builder.local_addr.map(|a| a.port()), Some(4001));
        assert!(builder.remote_addr.is_none());
    }

    #[tokio::test]
    async fn test_start_assigns_role() {
        let (a, b) = tokio::io::duplex(1024);
        let client = SessionBuilder::new().client().start(a);
        let server = SessionBuilder::new().server().start(b);

        assert!(client.is_client());
        assert!(!server.is_client());
        assert_eq!(client.open().unwrap().id(), 1);
        assert_eq!(server.open().unwrap().id(), 2);
    }
}
