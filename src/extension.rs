//! Pluggable sub-protocols layered on a session.
//!
//! An extension claims one stream type at or above
//! [`MIN_EXTENSION_STREAM_TYPE`]; SYNs carrying that type are queued for the
//! extension instead of for [`Session::accept`]. It may also claim one frame
//! type in `0x10..=0x1F`, whose frames the read loop hands to
//! [`Extension::handle_frame`].
//!
//! Extensions are passed in when the session is built; each session owns
//! its own registry.
//!
//! # Example
//!
//! ```ignore
//! struct Heartbeat;
//!
//! impl Extension for Heartbeat {
//!     fn start(&self, _session: Session, mut accept: ExtAccept) -> StreamType {
//!         tokio::spawn(async move {
//!             while let Ok(stream) = accept.accept().await {
//!                 // answer heartbeats on `stream`
//!             }
//!         });
//!         MIN_EXTENSION_STREAM_TYPE
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::{MuxError, Result};
use crate::protocol::{
    ErrorCode, Frame, StreamType, MIN_EXTENSION_FRAME_TYPE, MIN_EXTENSION_STREAM_TYPE, TYPE_MASK,
};
use crate::session::{Session, Termination};
use crate::stream::{MuxStream, Stream};

/// A sub-protocol sharing the session's connection.
pub trait Extension<S: MuxStream = Stream>: Send + Sync + 'static {
    /// Called once while the session is built. Returns the stream type
    /// whose SYNs should be delivered through `accept`.
    fn start(&self, session: Session<S>, accept: ExtAccept<S>) -> StreamType;

    /// Frame type this extension receives, if any.
    fn frame_type(&self) -> Option<u8> {
        None
    }

    /// Called from the read loop for every frame of [`frame_type`](Extension::frame_type).
    /// Must not block.
    fn handle_frame(&self, frame: Frame) {
        let _ = frame;
    }
}

/// Accept queue for an extension's stream type.
pub struct ExtAccept<S: MuxStream = Stream> {
    rx: mpsc::Receiver<Arc<S>>,
    termination: watch::Receiver<Option<Termination>>,
}

impl<S: MuxStream> ExtAccept<S> {
    /// Wait for the next stream of this extension's type.
    ///
    /// Fails with [`MuxError::SessionClosed`] once the session has ended;
    /// extensions should treat that as their signal to stop.
    pub async fn accept(&mut self) -> Result<Arc<S>> {
        if let Some(code) = self.termination_code() {
            return Err(MuxError::SessionClosed(code));
        }

        let stream = tokio::select! {
            biased;
            _ = self.termination.wait_for(Option::is_some) => None,
            stream = self.rx.recv() => stream,
        };
        stream.ok_or_else(|| {
            MuxError::SessionClosed(self.termination_code().unwrap_or(ErrorCode::InternalError))
        })
    }

    fn termination_code(&self) -> Option<ErrorCode> {
        self.termination.borrow().as_ref().map(|t| t.code)
    }
}

/// Per-session extension table, owned by the read loop.
pub(crate) struct ExtensionRegistry<S: MuxStream> {
    accept_queues: HashMap<StreamType, mpsc::Sender<Arc<S>>>,
    frame_handlers: HashMap<u8, Arc<dyn Extension<S>>>,
}

impl<S: MuxStream> ExtensionRegistry<S> {
    pub fn new() -> Self {
        Self {
            accept_queues: HashMap::new(),
            frame_handlers: HashMap::new(),
        }
    }

    /// Start `extension` and record the types it claims.
    ///
    /// Claims outside the extension ranges, or already taken by an earlier
    /// extension, are logged and ignored.
    pub fn register(&mut self, extension: Arc<dyn Extension<S>>, session: &Session<S>, backlog: usize) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let accept = ExtAccept {
            rx,
            termination: session.termination_receiver(),
        };

        let stream_type = extension.start(session.clone(), accept);
        if stream_type < MIN_EXTENSION_STREAM_TYPE {
            tracing::warn!("Extension claimed non-extension stream type {:#x}", stream_type);
        } else if self.accept_queues.contains_key(&stream_type) {
            tracing::warn!("Extension stream type {:#x} already registered", stream_type);
        } else {
            self.accept_queues.insert(stream_type, tx);
        }

        if let Some(frame_type) = extension.frame_type() {
            if !(MIN_EXTENSION_FRAME_TYPE..=TYPE_MASK).contains(&frame_type) {
                tracing::warn!("Extension claimed non-extension frame type {:#x}", frame_type);
            } else if self.frame_handlers.contains_key(&frame_type) {
                tracing::warn!("Extension frame type {:#x} already registered", frame_type);
            } else {
                self.frame_handlers.insert(frame_type, extension);
            }
        }
    }

    /// Accept queue for an extension stream type.
    pub fn accept_queue(&self, stream_type: StreamType) -> Option<&mpsc::Sender<Arc<S>>> {
        self.accept_queues.get(&stream_type)
    }

    /// Route a frame of a non-core type. Unclaimed types are dropped.
    pub fn dispatch_frame(&self, frame: Frame) {
        match self.frame_handlers.get(&frame.raw_type()) {
            Some(extension) => extension.handle_frame(frame),
            None => {
                tracing::debug!(
                    "Ignoring frame of unregistered type {:#x} on stream {}",
                    frame.raw_type(),
                    frame.stream_id()
                );
            }
        }
    }
}
