//! Virtual sockets backed by host TCP streams and listeners.
//!
//! The sandbox polls: it never blocks in `read` or `accept`. A background
//! task per backing stream moves received bytes into a chunk buffer, and a
//! per-listener task moves accepted connections into a backlog. The
//! sandbox-facing calls only ever inspect those buffers.
//!
//! Receiving pauses once [`MAX_BUFFERED_BYTES`] are waiting for the sandbox
//! and resumes as `read` drains them, so a sandbox that stops reading pushes
//! back on the peer instead of growing host memory.

use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{PassthroughError, Result};

use super::addr::family_code;

/// `read` result when no data is buffered yet.
pub const EAGAIN_CODE: i64 = -11;

/// `read` result once the peer has closed and the buffer is drained.
pub const EOF_CODE: i64 = -4095;

/// Received bytes held for the sandbox before receiving pauses.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Up to `max_bytes` of buffered data.
    Data(Bytes),
    /// Nothing buffered, peer still open.
    WouldBlock,
    /// Peer closed and nothing left.
    Eof,
}

impl ReadOutcome {
    /// Wire form: hex string, [`EAGAIN_CODE`] or [`EOF_CODE`].
    pub fn into_value(self) -> Value {
        match self {
            ReadOutcome::Data(data) => Value::String(hex::encode(data)),
            ReadOutcome::WouldBlock => Value::from(EAGAIN_CODE),
            ReadOutcome::Eof => Value::from(EOF_CODE),
        }
    }
}

#[derive(Debug, Default)]
struct SocketState {
    recv_buffer: VecDeque<Bytes>,
    buffered: usize,
    eof: bool,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    backlog: VecDeque<(TcpStream, SocketAddr)>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock(state: &Mutex<SocketState>) -> MutexGuard<'_, SocketState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A sandbox-visible socket.
#[derive(Debug)]
pub struct VirtualSocket {
    id: u32,
    state: Arc<Mutex<SocketState>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    drained: Arc<Notify>,
    closed: watch::Sender<bool>,
}

impl VirtualSocket {
    /// Create an unconnected socket.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SocketState::default())),
            writer: tokio::sync::Mutex::new(None),
            drained: Arc::new(Notify::new()),
            closed: watch::channel(false).0,
        }
    }

    /// Sandbox-visible id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Open an outbound TCP connection and start receiving from it.
    pub async fn connect(&self, addr: SocketAddrV4) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        tracing::debug!(socket = self.id, %addr, "Connected");
        self.attach(stream).await
    }

    /// Back this socket with an established stream.
    pub async fn attach(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);

        let task = tokio::spawn(receive_loop(
            self.id,
            reader,
            Arc::clone(&self.state),
            Arc::clone(&self.drained),
        ));
        let mut state = lock(&self.state);
        state.peer = Some(peer);
        state.local = Some(local);
        state.eof = false;
        state.tasks.push(task);
        Ok(())
    }

    /// Start listening on `addr`. Returns the bound address.
    pub async fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::debug!(socket = self.id, %local, "Listening");

        let task = tokio::spawn(accept_loop(self.id, listener, Arc::clone(&self.state)));
        let mut state = lock(&self.state);
        state.local = Some(local);
        state.tasks.push(task);
        Ok(local)
    }

    /// Take the oldest pending inbound connection, if any.
    pub fn accept(&self) -> Option<(TcpStream, SocketAddr)> {
        lock(&self.state).backlog.pop_front()
    }

    /// Number of inbound connections waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        lock(&self.state).backlog.len()
    }

    /// Read at most `max_bytes` of buffered data without waiting.
    ///
    /// Data is taken from the oldest chunk only; if it is longer than
    /// `max_bytes` the remainder stays at the head of the buffer.
    pub fn read(&self, max_bytes: usize) -> ReadOutcome {
        let mut state = lock(&self.state);
        let data = match state.recv_buffer.pop_front() {
            Some(mut chunk) if chunk.len() > max_bytes => {
                let head = chunk.split_to(max_bytes);
                state.recv_buffer.push_front(chunk);
                head
            }
            Some(chunk) => chunk,
            None if state.eof => return ReadOutcome::Eof,
            None => return ReadOutcome::WouldBlock,
        };
        state.buffered -= data.len();
        drop(state);
        self.drained.notify_one();
        ReadOutcome::Data(data)
    }

    /// Bytes received and not yet read by the sandbox.
    pub fn buffered_len(&self) -> usize {
        lock(&self.state).buffered
    }

    /// Write `data` to the backing connection.
    ///
    /// A write still waiting on the peer when the socket is closed is
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if the socket has no backing connection, and
    /// `ConnectionClosed` if it was closed before the write finished.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return Err(PassthroughError::NotConnected(self.id));
        }

        tokio::select! {
            result = self.write_to_peer(data) => result,
            _ = closed.wait_for(|closed| *closed) => Err(PassthroughError::ConnectionClosed),
        }
    }

    async fn write_to_peer(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or(PassthroughError::NotConnected(self.id))?;
        stream.write_all(data).await?;
        Ok(data.len())
    }

    /// Tear down the backing connection or listener.
    ///
    /// Never waits for a pending write: the write is cancelled and its half
    /// of the stream is dropped with it.
    pub async fn close(&self) {
        self.closed.send_replace(true);

        let writer = match self.writer.try_lock() {
            Ok(mut writer) => writer.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(socket = self.id, "Shutdown failed: {}", e);
            }
        }

        let mut state = lock(&self.state);
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.backlog.clear();
        state.recv_buffer.clear();
        state.buffered = 0;
        state.eof = true;
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        lock(&self.state)
            .peer
            .ok_or(PassthroughError::NotConnected(self.id))
    }

    /// Local address of the connection or listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        lock(&self.state)
            .local
            .ok_or(PassthroughError::NotConnected(self.id))
    }

    /// Peer address as text.
    pub fn remote_address(&self) -> Result<String> {
        Ok(self.peer_addr()?.ip().to_string())
    }

    /// Peer port in host order.
    pub fn remote_port(&self) -> Result<u16> {
        Ok(self.peer_addr()?.port())
    }

    /// Peer address family.
    pub fn remote_family(&self) -> Result<i64> {
        Ok(family_code(&self.peer_addr()?))
    }

    #[cfg(test)]
    pub(crate) fn deliver(&self, chunk: &'static [u8]) {
        let mut state = lock(&self.state);
        state.buffered += chunk.len();
        state.recv_buffer.push_back(Bytes::from_static(chunk));
    }

    #[cfg(test)]
    pub(crate) fn mark_eof(&self) {
        lock(&self.state).eof = true;
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        for task in lock(&self.state).tasks.drain(..) {
            task.abort();
        }
    }
}

async fn receive_loop(
    id: u32,
    mut reader: OwnedReadHalf,
    state: Arc<Mutex<SocketState>>,
    drained: Arc<Notify>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        while lock(&state).buffered >= MAX_BUFFERED_BYTES {
            drained.notified().await;
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(socket = id, "Peer closed");
                lock(&state).eof = true;
                return;
            }
            Ok(n) => {
                let mut state = lock(&state);
                state.buffered += n;
                state.recv_buffer.push_back(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                // The stream is unusable; buffered data stays readable.
                tracing::warn!(socket = id, "Socket error: {}", e);
                lock(&state).eof = true;
                return;
            }
        }
    }
}

async fn accept_loop(id: u32, listener: TcpListener, state: Arc<Mutex<SocketState>>) {
    let mut failures = 0u32;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                failures = 0;
                tracing::debug!(socket = id, %peer, "Inbound connection");
                lock(&state).backlog.push_back((stream, peer));
            }
            Err(e) => {
                if failures == 0 {
                    tracing::warn!(socket = id, "Accept failed: {}", e);
                } else {
                    tracing::debug!(socket = id, failures, "Accept failed: {}", e);
                }
                tokio::time::sleep(accept_backoff(failures)).await;
                failures = failures.saturating_add(1);
            }
        }
    }
}

/// Delay before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_RETRY_BASE
        .saturating_mul(1 << failures.min(10))
        .min(ACCEPT_RETRY_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_read_splits_oversized_chunk() {
        let socket = VirtualSocket::new(5);
        socket.deliver(b"0123456789");

        assert_eq!(socket.read(4), ReadOutcome::Data(Bytes::from_static(b"0123")));
        assert_eq!(socket.buffered_len(), 6);
        assert_eq!(socket.read(100), ReadOutcome::Data(Bytes::from_static(b"456789")));
        assert_eq!(socket.read(100), ReadOutcome::WouldBlock);
        assert_eq!(socket.buffered_len(), 0);
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(0), Duration::from_millis(10));
        assert_eq!(accept_backoff(1), Duration::from_millis(20));
        assert_eq!(accept_backoff(3), Duration::from_millis(80));
        assert_eq!(accept_backoff(7), ACCEPT_RETRY_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_RETRY_MAX);
    }

    #[test]
    fn test_read_never_merges_chunks() {
        let socket = VirtualSocket::new(5);
        socket.deliver(b"ab");
        socket.deliver(b"cd");

        assert_eq!(socket.read(10), ReadOutcome::Data(Bytes::from_static(b"ab")));
        assert_eq!(socket.read(10), ReadOutcome::Data(Bytes::from_static(b"cd")));
    }

    #[test]
    fn test_eof_after_buffer_drained() {
        let socket = VirtualSocket::new(5);
        socket.deliver(b"tail");
        socket.mark_eof();

        assert_eq!(socket.read(10), ReadOutcome::Data(Bytes::from_static(b"tail")));
        assert_eq!(socket.read(10), ReadOutcome::Eof);
    }

    #[test]
    fn test_read_outcome_wire_values() {
        assert_eq!(
            ReadOutcome::Data(Bytes::from_static(b"\x01\xab")).into_value(),
            Value::from("01ab")
        );
        assert_eq!(ReadOutcome::WouldBlock.into_value(), Value::from(-11));
        assert_eq!(ReadOutcome::Eof.into_value(), Value::from(-4095));
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let socket = VirtualSocket::new(7);
        let err = socket.write(b"x").await.unwrap_err();
        assert!(matches!(err, PassthroughError::NotConnected(7)));
        assert!(socket.remote_port().is_err());
    }

    #[tokio::test]
    async fn test_bind_accept_and_exchange() {
        let listener = VirtualSocket::new(5);
        let local = listener
            .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let SocketAddr::V4(target) = local else {
            panic!("expected v4 address");
        };

        let client = VirtualSocket::new(6);
        client.connect(target).await.unwrap();
        assert_eq!(client.remote_port().unwrap(), local.port());
        assert_eq!(client.remote_address().unwrap(), "127.0.0.1");

        wait_for(|| listener.backlog_len() == 1).await;
        let (stream, _) = listener.accept().unwrap();
        assert!(listener.accept().is_none());

        let server_side = VirtualSocket::new(7);
        server_side.attach(stream).await.unwrap();

        client.write(b"hello").await.unwrap();
        let received = Mutex::new(Vec::new());
        wait_for(|| {
            if let ReadOutcome::Data(chunk) = server_side.read(64) {
                received.lock().unwrap().extend_from_slice(&chunk);
            }
            received.lock().unwrap().len() == 5
        })
        .await;
        assert_eq!(received.into_inner().unwrap(), b"hello".to_vec());

        client.close().await;
        wait_for(|| server_side.read(64) == ReadOutcome::Eof).await;
    }

    async fn connected_pair() -> (VirtualSocket, TcpStream) {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(target) = remote.local_addr().unwrap() else {
            panic!("expected v4 address");
        };
        let socket = VirtualSocket::new(5);
        socket.connect(target).await.unwrap();
        let (peer, _) = remote.accept().await.unwrap();
        (socket, peer)
    }

    #[tokio::test]
    async fn test_close_cancels_blocked_write() {
        let (socket, _peer) = connected_pair().await;
        let socket = Arc::new(socket);

        // The peer never reads, so this write cannot finish.
        let writer = Arc::clone(&socket);
        let pending = tokio::spawn(async move {
            let data = vec![0u8; 64 * 1024 * 1024];
            writer.write(&data).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        tokio::time::timeout(Duration::from_secs(3), socket.close())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PassthroughError::ConnectionClosed)));
        assert!(matches!(
            socket.write(b"x").await,
            Err(PassthroughError::NotConnected(5))
        ));
    }

    #[tokio::test]
    async fn test_receive_pauses_at_high_water_mark() {
        let (socket, mut peer) = connected_pair().await;
        let total = 4 * MAX_BUFFERED_BYTES;
        let sender = tokio::spawn(async move {
            peer.write_all(&vec![7u8; total]).await.unwrap();
        });

        wait_for(|| socket.buffered_len() >= MAX_BUFFERED_BYTES).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(socket.buffered_len() <= MAX_BUFFERED_BYTES + READ_BUFFER_SIZE);

        let drain = async {
            let mut received = 0;
            while received < total {
                match socket.read(READ_BUFFER_SIZE) {
                    ReadOutcome::Data(chunk) => received += chunk.len(),
                    ReadOutcome::WouldBlock => tokio::time::sleep(Duration::from_millis(1)).await,
                    ReadOutcome::Eof => panic!("eof after {} bytes", received),
                }
            }
            received
        };
        let received = tokio::time::timeout(Duration::from_secs(10), drain)
            .await
            .unwrap();

        assert_eq!(received, total);
        assert_eq!(socket.buffered_len(), 0);
        sender.await.unwrap();
    }
}
