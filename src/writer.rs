//! Writer task that owns the write half of the channel.
//!
//! Replies produced by the read loop go through an mpsc channel to a single
//! task, so frames never interleave on the wire and several replies that
//! become ready together leave in one vectored write.
//!
//! ```text
//! read loop ─► mpsc::Sender<OutboundFrame> ─► writer task ─► channel
//! ```
//!
//! A pending-frame counter gives the read loop backpressure: once the
//! sandbox stops draining the channel, `send` waits up to the configured
//! timeout for the writer to release frames instead of buffering without
//! limit.

use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{PassthroughError, Result};
use crate::protocol::{Header, Response, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Payload used when a response cannot be serialized.
const FALLBACK_RESPONSE: &[u8] =
    br#"{"type":"callback","error":{"message":"Failed to encode response","code":"EPROTO"},"result":null}"#;

/// A frame ready to be written to the channel.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded 12-byte header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for the "no queued result" poll reply).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a frame carrying `payload` under `call_id`.
    #[inline]
    pub fn new(call_id: u32, payload: Bytes) -> Self {
        let header = Header::new(call_id, payload.len() as u32);
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Create a frame with an empty payload.
    #[inline]
    pub fn empty(call_id: u32) -> Self {
        Self {
            header: Header::new(call_id, 0).encode(),
            payload: Bytes::new(),
        }
    }

    /// Encode a response envelope into a frame.
    pub fn response(call_id: u32, response: &Response) -> Self {
        Self::new(call_id, encode_response(response))
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames handed over and not yet written.
    pending: Arc<AtomicUsize>,
    /// Signalled by the writer task after each written batch.
    released: Arc<Notify>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits while `max_pending` frames are outstanding, up to the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` if the sandbox does not drain the
    /// channel in time, or `ConnectionClosed` if the writer task has ended.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.wait_for_capacity().await?;

        // Count before sending so the writer never decrements below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            PassthroughError::ConnectionClosed
        })
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let wait = async {
            loop {
                // Registered before the check so a release in between is seen.
                let released = self.released.notified();
                if self.pending.load(Ordering::Acquire) < self.max_pending {
                    return;
                }
                released.await;
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| PassthroughError::BackpressureTimeout)
    }
}

/// Serialize a response, falling back to a fixed error envelope.
pub fn encode_response(response: &Response) -> Bytes {
    match response.to_vec() {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            Bytes::from_static(FALLBACK_RESPONSE)
        }
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The returned `JoinHandle` resolves once every handle is dropped and the
/// queued frames are flushed, or on the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let handle = WriterHandle {
        tx,
        pending: Arc::new(AtomicUsize::new(0)),
        released: Arc::new(Notify::new()),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(
        rx,
        writer,
        Arc::clone(&handle.pending),
        Arc::clone(&handle.released),
    ));

    (handle, task)
}

/// Receive frames and write them out in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    released: Arc<Notify>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Channel write failed: {}", e);
            return Err(e);
        }

        pending.fetch_sub(batch_size, Ordering::Release);
        released.notify_waiters();
    }
}

/// Write a batch of frames with `write_vectored`, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "channel accepted no bytes").into());
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything in `batch` after the first `skip` bytes.
fn remaining_slices(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let parts = batch
        .iter()
        .flat_map(|frame| [&frame.header[..], &frame.payload[..]]);

    for part in parts {
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        slices.push(IoSlice::new(&part[skip..]));
        skip = 0;
    }
    slices
}
