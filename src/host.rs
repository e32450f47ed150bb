//! Host builder and channel read loop.
//!
//! The [`HostBuilder`] collects configuration; the [`PassthroughHost`] owns
//! the shared host state and serves channels:
//! 1. Split the channel into read and write halves
//! 2. Spawn the writer task on the write half
//! 3. Decode frames from the read half and dispatch them in order
//! 4. On end of stream, flush pending replies and return
//!
//! # Example
//!
//! ```no_run
//! use sandbox_passthrough::transport::Channel;
//! use sandbox_passthrough::PassthroughHost;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = PassthroughHost::builder()
//!         .root("/srv/sandbox")
//!         .queue_capacity(256)
//!         .build();
//!
//!     let (channel, sandbox_end) = Channel::pair()?;
//!     // ... hand `sandbox_end` to the sandboxed process ...
//!     # drop(sandbox_end);
//!     host.serve(channel).await?;
//!     Ok(())
//! }
//! ```

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::handler::{HostState, DEFAULT_MAX_RANDOM_BYTES};
use crate::protocol::{FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::queue::{AsyncResultQueue, DEFAULT_QUEUE_CAPACITY};
use crate::transport::Channel;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Size of each read from the channel.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory sandbox paths resolve against.
    ///
    /// Default: the process working directory.
    pub root: PathBuf,
    /// Largest accepted frame payload, in bytes.
    ///
    /// Default: 16 MiB
    pub max_payload_size: u32,
    /// Capacity of the async result queue (queued + in flight).
    ///
    /// Default: 1024
    pub queue_capacity: usize,
    /// Largest `crypto.randomBytes` request.
    ///
    /// Default: 65536
    pub max_random_bytes: usize,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_random_bytes: DEFAULT_MAX_RANDOM_BYTES,
            writer: WriterConfig::default(),
        }
    }
}

/// Builder for configuring and creating a [`PassthroughHost`].
#[derive(Debug, Clone, Default)]
pub struct HostBuilder {
    config: HostConfig,
}

impl HostBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory sandbox paths resolve against.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Set the largest accepted frame payload.
    ///
    /// Default: 16 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the async result queue capacity.
    ///
    /// Asynchronous calls beyond this many queued or running results are
    /// refused with `EQUEUEFULL`.
    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the largest `crypto.randomBytes` request.
    ///
    /// Default: 65536
    pub fn max_random_bytes(mut self, size: usize) -> Self {
        self.config.max_random_bytes = size;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Use a complete configuration.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the host.
    pub fn build(self) -> PassthroughHost {
        PassthroughHost::new(self.config)
    }
}

/// Serves host operations to a sandboxed process.
///
/// All channels served by one host share its files, sockets and async
/// result queue.
#[derive(Debug, Clone)]
pub struct PassthroughHost {
    config: HostConfig,
    dispatcher: Dispatcher,
}

impl PassthroughHost {
    /// Create a new host builder.
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Create a host from a configuration.
    pub fn new(config: HostConfig) -> Self {
        let state = HostState::new(
            config.root.clone(),
            config.max_payload_size as usize,
            config.max_random_bytes,
        );
        let queue = AsyncResultQueue::new(config.queue_capacity);
        let dispatcher = Dispatcher::new(Arc::new(state), queue);
        Self { config, dispatcher }
    }

    /// Active configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The dispatcher frames are routed through.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve an inherited channel descriptor until the sandbox closes it.
    pub async fn serve_fd(&self, fd: OwnedFd) -> Result<()> {
        self.serve(Channel::from_fd(fd)?).await
    }

    /// Serve one channel until end of stream.
    ///
    /// # Errors
    ///
    /// Returns the decoder's `Protocol` error on a corrupt frame stream, or
    /// the I/O error that ended the channel.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.serve_split(reader, writer).await
    }

    /// Serve a channel given as separate read and write halves.
    pub async fn serve_split<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, self.config.writer.clone());

        let result = self.read_loop(reader, &writer).await;
        if let Err(e) = &result {
            tracing::error!("Read loop error: {}", e);
        }

        // Let queued replies drain before reporting.
        drop(writer);
        match writer_task.await {
            Ok(Err(e)) if result.is_ok() => return Err(e),
            Err(e) => tracing::error!("Writer task failed: {}", e),
            _ => {}
        }
        result
    }

    async fn read_loop<R>(&self, mut reader: R, writer: &WriterHandle) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_buffer = FrameBuffer::with_max_payload(self.config.max_payload_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("Channel closed by sandbox");
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };

            for frame in frame_buffer.push(&buf[..n])? {
                let (payload, call_id) = frame.into_parts();
                if let Some(reply) = self.dispatcher.dispatch(payload, call_id).await {
                    writer.send(reply).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.root, PathBuf::from("."));
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_random_bytes, 65536);
    }

    #[test]
    fn test_builder_configuration() {
        let host = PassthroughHost::builder()
            .root("/tmp/box")
            .max_payload_size(4096)
            .queue_capacity(8)
            .max_random_bytes(16)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10))
            .build();

        let config = host.config();
        assert_eq!(config.root, PathBuf::from("/tmp/box"));
        assert_eq!(config.max_payload_size, 4096);
        assert_eq!(config.writer.max_pending_frames, 2048);
        assert_eq!(config.writer.channel_capacity, 512);
        assert_eq!(config.writer.backpressure_timeout, Duration::from_secs(10));
        assert_eq!(host.dispatcher().queue().capacity(), 8);
        assert_eq!(host.dispatcher().state().max_random_bytes(), 16);
    }

    #[tokio::test]
    async fn test_serve_returns_on_immediate_close() {
        let (sandbox, host_end) = tokio::io::duplex(1024);
        drop(sandbox);

        let host = PassthroughHost::builder().build();
        host.serve(host_end).await.unwrap();
    }
}
