//! Message channels shared with the sandboxed process.
//!
//! The sandbox inherits its end of each channel as a fixed descriptor.
//! The host keeps the other end as a [`Channel`], a non-blocking Unix
//! stream socket driven by tokio.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_passthrough::transport::Channel;
//!
//! # async fn demo() -> sandbox_passthrough::error::Result<()> {
//! let (host_end, sandbox_end) = Channel::pair()?;
//! // Hand `sandbox_end` to the child as descriptor 4, serve `host_end`.
//! # drop((host_end, sandbox_end));
//! # Ok(())
//! # }
//! ```

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::error::Result;

/// Sandbox standard input.
pub const STDIN_FD: RawFd = 0;

/// Sandbox standard output.
pub const STDOUT_FD: RawFd = 1;

/// Sandbox standard error.
pub const STDERR_FD: RawFd = 2;

/// Descriptor of the asynchronous message channel inside the sandbox.
pub const ASYNC_CHANNEL_FD: RawFd = 3;

/// Descriptor of the synchronous message channel inside the sandbox.
pub const SYNC_CHANNEL_FD: RawFd = 4;

/// Number of descriptors the sandbox reserves before any virtual socket.
pub const RESERVED_DESCRIPTORS: u32 = 5;

/// Host end of a message channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Adopt an already connected descriptor.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Self::from_std(StdUnixStream::from(fd))
    }

    /// Adopt a connected std stream, switching it to non-blocking mode.
    pub fn from_std(stream: StdUnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(Self { stream })
    }

    /// Create a connected pair: the host end, and the blocking std end
    /// destined for the sandbox.
    pub fn pair() -> Result<(Self, StdUnixStream)> {
        let (host, sandbox) = StdUnixStream::pair()?;
        Ok((Self::from_std(host)?, sandbox))
    }

    /// Raw descriptor of the host end.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Split into owned read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
