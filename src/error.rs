//! Error types for sandbox-passthrough.

use thiserror::Error;

/// Main error type for all passthrough operations.
#[derive(Debug, Error)]
pub enum PassthroughError {
    /// I/O error from a host operation or a channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed hex payload.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Protocol error (bad magic, oversize frame, malformed envelope).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Call id is neither zero (sync) nor a positive async tag.
    #[error("Invalid call id: {0}")]
    InvalidCallId(i64),

    /// Unsupported socket domain/type/protocol/family combination.
    #[error("Unsupported socket: {0}")]
    UnsupportedSocket(String),

    /// Unknown `api` namespace.
    #[error("Unhandled api: {0}")]
    UnhandledApi(String),

    /// Unknown method within a known namespace.
    #[error("Unhandled method: {api}.{method}")]
    UnhandledMethod {
        /// Namespace the method was looked up in.
        api: String,
        /// Normalized method name.
        method: String,
    },

    /// Argument missing or of the wrong type.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No open file or virtual socket behind the given descriptor.
    #[error("Bad descriptor: {0}")]
    BadDescriptor(i64),

    /// Virtual socket has no backing connection.
    #[error("Socket {0} is not connected")]
    NotConnected(u32),

    /// Name resolution returned no usable address.
    #[error("getaddrinfo ENOTFOUND {0}")]
    HostNotFound(String),

    /// Async result queue has no free slot.
    #[error("Async result queue is full (capacity {0})")]
    QueueFull(usize),

    /// Writer stayed saturated past the configured timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl PassthroughError {
    /// Create a protocol error from anything displayable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Result type alias using PassthroughError.
pub type Result<T> = std::result::Result<T, PassthroughError>;
