//! Dedicated writer task: the write half of the frame transport.
//!
//! Every stream and the session itself hand frames to one writer task through
//! an mpsc channel, so two frames are never interleaved on the wire and lock
//! contention on the connection is avoided. The task batches whatever is
//! queued into a single vectored write.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► Writer Task ─► Connection
//! Session  ─┘
//! ```
//!
//! The channel is unbounded because frames are enqueued from poll functions
//! and drop paths that cannot await. Memory is bounded by the per-stream
//! flow-control windows instead of by channel capacity.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{MuxError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum frames to batch in a single write operation.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// Default time allowed to flush queued frames when the writer shuts down.
pub const DEFAULT_SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame ready to be written to the connection.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Encoded header.
    pub header: Header,
    /// Payload bytes (can be empty for SYN, FIN, etc.).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: *header,
            payload,
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum frames coalesced into one vectored write.
    pub max_batch_size: usize,
    /// How long queued frames may take to flush once shutdown is requested.
    pub shutdown_flush_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            shutdown_flush_timeout: DEFAULT_SHUTDOWN_FLUSH_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across streams.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::UnboundedSender<OutboundFrame>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
    /// Set once shutdown has been requested.
    shutdown: Arc<watch::Sender<bool>>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Never waits. Fails with [`MuxError::ConnectionClosed`] once the writer
    /// has been shut down or has stopped.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(MuxError::ConnectionClosed);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            MuxError::ConnectionClosed
        })
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Flush what is queued, then shut the connection's write side down.
    ///
    /// Frames queued before this call are still written; later sends fail.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Check whether the writer no longer accepts frames.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The JoinHandle resolves when the writer has shut down, with the I/O error
/// that stopped it, if any.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        shutdown: Arc::new(shutdown_tx),
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, shutdown_rx, config));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives frames and writes them to the connection.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
    config: WriterConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let max_batch = config.max_batch_size.max(1);

    loop {
        // Queued frames win over shutdown so that a final GOAWAY still goes out.
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
            _ = shutdown.wait_for(|closed| *closed) => break,
        };

        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Frame write failed: {}", e);
            return Err(e);
        }
        pending.fetch_sub(batch_size, Ordering::Release);
    }

    rx.close();
    let mut rest = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        rest.push(frame);
    }

    let flush = async {
        write_batch(&mut writer, &rest).await?;
        writer.shutdown().await?;
        Ok::<(), MuxError>(())
    };
    match tokio::time::timeout(config.shutdown_flush_timeout, flush).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "Timed out flushing {} frames during writer shutdown",
                rest.len()
            );
            Ok(())
        }
    }
}

/// Write one frame directly, bypassing any writer task.
///
/// Useful for tools and tests that drive a raw peer.
pub async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_batch(writer, std::slice::from_ref(frame)).await
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(frame.header.as_bytes()));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }
    if written == 0 {
        return Err(write_zero());
    }

    // Partial write, continue with the remaining data
    let mut total_written = written;
    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> MuxError {
    std::io::Error::new(std::io::ErrorKind::WriteZero, "write_vectored returned 0").into()
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;
        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header.as_bytes()[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();
            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}
