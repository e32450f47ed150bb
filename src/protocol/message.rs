//! RPC envelope carried in frame payloads.
//!
//! Requests:
//! ```text
//! {"type":"api","api":"fs","method":"statSync","data":["sandbox.js"],"callback":0}
//! {"type":"request_async_response"}
//! ```
//! Responses:
//! ```text
//! {"type":"callback","error":null,"result":{...}}
//! ```

use std::io;

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PassthroughError, Result};

/// Envelope `type` of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A namespaced host call.
    Api,
    /// Poll for the next queued asynchronous completion.
    RequestAsyncResponse,
}

impl MessageKind {
    /// Parse the `type` field.
    pub fn parse(kind: &str) -> Result<Self> {
        match kind {
            "api" => Ok(Self::Api),
            "request_async_response" => Ok(Self::RequestAsyncResponse),
            other => Err(PassthroughError::protocol(format!(
                "Unknown message type: {}",
                other
            ))),
        }
    }
}

/// Decoded request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    /// Raw `type` field; see [`RpcMessage::kind`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Namespace (`fs`, `dns`, `net`, `crypto`).
    #[serde(default)]
    pub api: Option<String>,
    /// Method name, possibly carrying a `Sync` suffix.
    #[serde(default)]
    pub method: Option<String>,
    /// Arguments: a bare string or a list.
    #[serde(default)]
    pub data: Value,
    /// Opaque caller tag, echoed in the response.
    #[serde(default)]
    pub callback: Option<Value>,
}

impl RpcMessage {
    /// Parse a request from payload bytes.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            PassthroughError::protocol(format!("Error parsing message JSON: {}", e))
        })
    }

    /// Typed view of the `type` field.
    pub fn kind(&self) -> Result<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Argument list built from `data`.
    ///
    /// A bare string becomes a one-element list, a list is used as-is,
    /// any other value is wrapped and an absent value gives no arguments.
    pub fn args(&self) -> Vec<Value> {
        match &self.data {
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

/// Error object placed in the `error` field of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message.
    pub message: String,
    /// Symbolic code (`ENOENT`, `EUNHANDLEDAPI`, ...).
    pub code: String,
    /// Negative errno for host I/O errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    /// Host call that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall: Option<String>,
    /// Path involved, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorPayload {
    /// Create a payload with just a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            errno: None,
            syscall: None,
            path: None,
        }
    }

    /// Attach the failing host call.
    pub fn with_syscall(mut self, syscall: impl Into<String>) -> Self {
        self.syscall = Some(syscall.into());
        self
    }

    /// Attach the path involved.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl From<&PassthroughError> for ErrorPayload {
    fn from(err: &PassthroughError) -> Self {
        match err {
            PassthroughError::Io(io_err) => {
                let (code, errno) = io_error_code(io_err);
                let mut payload = ErrorPayload::new(code, io_err.to_string());
                payload.errno = errno;
                payload
            }
            PassthroughError::Json(_) | PassthroughError::Protocol(_) => {
                ErrorPayload::new("EPROTO", err.to_string())
            }
            PassthroughError::Hex(_) | PassthroughError::InvalidArgument(_) => {
                ErrorPayload::new("EINVAL", err.to_string())
            }
            PassthroughError::InvalidCallId(_) => {
                ErrorPayload::new("EINVALIDCALLID", err.to_string())
            }
            PassthroughError::UnsupportedSocket(_) => {
                ErrorPayload::new("EUNSUPPORTED", err.to_string())
            }
            PassthroughError::UnhandledApi(_) => ErrorPayload::new("EUNHANDLEDAPI", err.to_string()),
            PassthroughError::UnhandledMethod { .. } => {
                ErrorPayload::new("EUNHANDLEDMETHOD", err.to_string())
            }
            PassthroughError::BadDescriptor(_) => ErrorPayload::new("EBADF", err.to_string()),
            PassthroughError::NotConnected(_) => ErrorPayload::new("ENOTCONN", err.to_string()),
            PassthroughError::HostNotFound(_) => ErrorPayload::new("ENOTFOUND", err.to_string()),
            PassthroughError::QueueFull(_) => ErrorPayload::new("EQUEUEFULL", err.to_string()),
            PassthroughError::BackpressureTimeout => {
                ErrorPayload::new("ETIMEDOUT", err.to_string())
            }
            PassthroughError::ConnectionClosed => ErrorPayload::new("EPIPE", err.to_string()),
        }
    }
}

/// Map a host I/O error onto the symbolic code and negative errno the
/// sandboxed runtime understands.
fn io_error_code(err: &io::Error) -> (String, Option<i32>) {
    match err.raw_os_error() {
        Some(raw) => {
            let code = match Errno::from_raw(raw) {
                Errno::UnknownErrno => kind_code(err.kind()).to_string(),
                errno => format!("{:?}", errno),
            };
            (code, Some(-raw))
        }
        None => (kind_code(err.kind()).to_string(), None),
    }
}

fn kind_code(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => "EINVAL",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::NotConnected => "ENOTCONN",
        io::ErrorKind::AddrInUse => "EADDRINUSE",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::WouldBlock => "EAGAIN",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::Interrupted => "EINTR",
        io::ErrorKind::UnexpectedEof => "EOF",
        io::ErrorKind::Unsupported => "ENOSYS",
        _ => "EIO",
    }
}

/// Completion value of a host call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No value (`result: null`).
    Unit,
    /// One value, returned bare.
    Single(Value),
    /// Two values, returned as a 2-element list.
    Pair(Value, Value),
}

impl Outcome {
    /// Wrap a single serializable value.
    pub fn single(value: impl Into<Value>) -> Self {
        Self::Single(value.into())
    }

    /// Wrap two values.
    pub fn pair(first: impl Into<Value>, second: impl Into<Value>) -> Self {
        Self::Pair(first.into(), second.into())
    }

    /// JSON form of the `result` field.
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Unit => Value::Null,
            Outcome::Single(v) => v,
            Outcome::Pair(a, b) => Value::Array(vec![a, b]),
        }
    }
}

/// `type` tag of every response.
pub const CALLBACK_TYPE: &str = "callback";

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Always `"callback"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Echo of the request's `callback` tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<Value>,
    /// Error, or `null` on success.
    pub error: Option<ErrorPayload>,
    /// Result value, `null` on error.
    pub result: Value,
}

impl Response {
    /// Successful response.
    pub fn ok(outcome: Outcome) -> Self {
        Self {
            kind: CALLBACK_TYPE.to_string(),
            callback: None,
            error: None,
            result: outcome.into_value(),
        }
    }

    /// Failed response.
    pub fn err(error: ErrorPayload) -> Self {
        Self {
            kind: CALLBACK_TYPE.to_string(),
            callback: None,
            error: Some(error),
            result: Value::Null,
        }
    }

    /// Set the echoed callback tag.
    pub fn with_callback(mut self, callback: Option<Value>) -> Self {
        self.callback = callback;
        self
    }

    /// Serialize to payload bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
