//! Request dispatch: one decoded frame in, at most one reply frame out.
//!
//! A frame's payload is parsed as a JSON envelope and its `call_id` picks
//! the calling convention:
//!
//! - `request_async_response` pops the oldest queued completion (or replies
//!   with an empty frame when nothing is queued).
//! - `api` with `call_id == 0` runs the host operation and replies now.
//! - `api` with `call_id > 0` reserves a queue slot, spawns the operation and
//!   replies with nothing; the result waits for a poll. A call that finds
//!   the queue full is refused, and the refusal also waits for a poll.
//!
//! Every failure after framing becomes an error response, except for frames
//! the sandbox cannot collect a reply for, which are logged and dropped.
//! Nothing here returns an error to the read loop.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::PassthroughError;
use crate::handler::{virtual_path, Api, Args, CallContext, CallConvention, HostState};
use crate::protocol::{ErrorPayload, MessageKind, Response, RpcMessage, SYNC_CALL_ID};
use crate::queue::AsyncResultQueue;
use crate::writer::{encode_response, OutboundFrame};

/// Remove the first case-insensitive `sync` from a method name.
///
/// ```
/// use sandbox_passthrough::dispatch::normalize_method;
///
/// assert_eq!(normalize_method("statSync"), "stat");
/// assert_eq!(normalize_method("readFileSYNC"), "readFile");
/// assert_eq!(normalize_method("lookup"), "lookup");
/// ```
pub fn normalize_method(method: &str) -> String {
    match method.to_ascii_lowercase().find("sync") {
        Some(at) => {
            let mut normalized = String::with_capacity(method.len() - 4);
            normalized.push_str(&method[..at]);
            normalized.push_str(&method[at + 4..]);
            normalized
        }
        None => method.to_string(),
    }
}

/// Rewrite an absolute path in the first argument to a relative one.
///
/// Returns `true` if the argument was rewritten.
pub fn rewrite_path_arg(args: &mut [Value]) -> bool {
    if let Some(Value::String(path)) = args.first_mut() {
        if path.starts_with('/') {
            *path = virtual_path(path).into_owned();
            return true;
        }
    }
    false
}

/// Routes decoded frames to host operations.
///
/// Cheap to clone; clones share host state and the async result queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<HostState>,
    queue: AsyncResultQueue,
}

impl Dispatcher {
    /// Create a dispatcher over the given state and queue.
    pub fn new(state: Arc<HostState>, queue: AsyncResultQueue) -> Self {
        Self { state, queue }
    }

    /// Shared host state.
    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    /// Queue of completed asynchronous calls.
    pub fn queue(&self) -> &AsyncResultQueue {
        &self.queue
    }

    /// Handle one frame.
    ///
    /// Returns the frame to write back now, if any.
    pub async fn dispatch(&self, payload: Bytes, call_id: u32) -> Option<OutboundFrame> {
        if payload.is_empty() {
            return None;
        }

        let (message, kind) = match RpcMessage::from_slice(&payload)
            .and_then(|message| message.kind().map(|kind| (message, kind)))
        {
            Ok(parsed) => parsed,
            Err(e) => return self.reject_envelope(call_id, &e),
        };

        match kind {
            MessageKind::RequestAsyncResponse => Some(self.poll()),
            MessageKind::Api => self.start_call(message, call_id).await,
        }
    }

    /// Reply to a poll with the oldest queued completion.
    fn poll(&self) -> OutboundFrame {
        match self.queue.pop() {
            Some(entry) => OutboundFrame::new(entry.call_id, entry.payload),
            None => OutboundFrame::empty(SYNC_CALL_ID),
        }
    }

    fn reject_envelope(&self, call_id: u32, err: &PassthroughError) -> Option<OutboundFrame> {
        let response = Response::err(ErrorPayload::from(err));
        if call_id == SYNC_CALL_ID {
            tracing::warn!("Rejected request: {}", err);
            return Some(OutboundFrame::response(SYNC_CALL_ID, &response));
        }
        // Asynchronous sender: no result is queued for an unreadable request.
        tracing::warn!(call_id, "Dropped asynchronous request: {}", err);
        None
    }

    async fn start_call(&self, message: RpcMessage, call_id: u32) -> Option<OutboundFrame> {
        // Only call id 0 is ever answered on the channel; the sandbox reads
        // no reply after any other frame.
        let convention = match CallConvention::from_call_id(call_id) {
            Ok(convention) => convention,
            Err(e) => {
                tracing::warn!(call_id, "Dropped call: {}", e);
                return None;
            }
        };
        let context = match CallContext::admit(convention, &self.queue) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(call_id, "Refused call: {}", e);
                let response = Response::err(ErrorPayload::from(&e)).with_callback(message.callback);
                if !self.queue.refuse(call_id, encode_response(&response)) {
                    tracing::warn!(call_id, "Refusal list full, dropping response");
                }
                return None;
            }
        };

        if context.is_async() {
            let this = self.clone();
            tokio::spawn(async move {
                let response = this.execute(message).await;
                context.respond(&response);
            });
            return None;
        }

        let response = self.execute(message).await;
        context.respond(&response)
    }

    /// Run the host operation a request names and build its response.
    pub async fn execute(&self, message: RpcMessage) -> Response {
        let api = message.api.as_deref().unwrap_or_default();
        let method = normalize_method(message.method.as_deref().unwrap_or_default());
        let mut args = message.args();
        rewrite_path_arg(&mut args);
        let path = args.first().and_then(Value::as_str).map(str::to_owned);

        tracing::debug!(api, method = %method, "Host call");

        let response = match Api::resolve(api, &method) {
            Ok(call) => match self.state.invoke(call, &Args::new(args)).await {
                Ok(outcome) => Response::ok(outcome),
                Err(e) => {
                    tracing::debug!(api, method = %method, "Host call failed: {}", e);
                    Response::err(describe_failure(&e, call, path))
                }
            },
            Err(e) => {
                tracing::warn!("{}", e);
                Response::err(ErrorPayload::from(&e))
            }
        };
        response.with_callback(message.callback)
    }
}

/// Error payload for a failed operation; I/O errors carry the call and path.
fn describe_failure(err: &PassthroughError, call: Api, path: Option<String>) -> ErrorPayload {
    let payload = ErrorPayload::from(err);
    if !matches!(err, PassthroughError::Io(_)) {
        return payload;
    }
    let payload = payload.with_syscall(call.method_name());
    match (call, path) {
        (Api::Fs(_), Some(path)) => payload.with_path(path),
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    fn dispatcher_at(root: PathBuf, capacity: usize) -> Dispatcher {
        Dispatcher::new(
            Arc::new(HostState::new(root, 1 << 20, 1024)),
            AsyncResultQueue::new(capacity),
        )
    }

    fn request(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    fn decode(frame: &OutboundFrame) -> (u32, Value) {
        let header = Header::decode(&frame.header).unwrap();
        let body = if frame.payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&frame.payload).unwrap()
        };
        (header.call_id, body)
    }

    async fn wait_for_queue(dispatcher: &Dispatcher, len: usize) {
        for _ in 0..200 {
            if dispatcher.queue().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {}", len);
    }

    #[test]
    fn test_normalize_method() {
        assert_eq!(normalize_method("statSync"), "stat");
        assert_eq!(normalize_method("SyncStat"), "Stat");
        assert_eq!(normalize_method("syncsync"), "sync");
        assert_eq!(normalize_method("open"), "open");
    }

    #[test]
    fn test_rewrite_path_arg() {
        let mut args = vec![json!("/etc/passwd"), json!("/other")];
        assert!(rewrite_path_arg(&mut args));
        assert_eq!(args, vec![json!("./etc/passwd"), json!("/other")]);

        let mut relative = vec![json!("foo.txt")];
        assert!(!rewrite_path_arg(&mut relative));
        assert_eq!(relative, vec![json!("foo.txt")]);

        let mut numeric = vec![json!(5)];
        assert!(!rewrite_path_arg(&mut numeric));
    }

    #[tokio::test]
    async fn test_empty_payload_is_ignored() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);
        assert!(dispatcher.dispatch(Bytes::new(), 0).await.is_none());
        assert!(dispatcher.dispatch(Bytes::new(), 7).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_stat_responds_immediately() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sandbox.js"), b"//").unwrap();
        let dispatcher = dispatcher_at(dir.path().to_path_buf(), 4);

        let msg = json!({"type": "api", "api": "fs", "method": "statSync", "data": ["sandbox.js"], "callback": 3});
        let frame = dispatcher.dispatch(request(msg), 0).await.unwrap();
        let (call_id, body) = decode(&frame);

        assert_eq!(call_id, 0);
        assert_eq!(body["type"], "callback");
        assert_eq!(body["error"], Value::Null);
        assert_eq!(body["callback"], 3);
        assert_eq!(body["result"]["size"], 2);
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_io_error_names_syscall_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher_at(dir.path().to_path_buf(), 4);

        let msg = json!({"type": "api", "api": "fs", "method": "lstatSync", "data": "/missing"});
        let (_, body) = decode(&dispatcher.dispatch(request(msg), 0).await.unwrap());

        assert_eq!(body["result"], Value::Null);
        assert_eq!(body["error"]["code"], "ENOENT");
        assert_eq!(body["error"]["syscall"], "lstat");
        assert_eq!(body["error"]["path"], "./missing");
    }

    #[tokio::test]
    async fn test_async_call_then_poll() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);
        let msg = json!({"type": "api", "api": "crypto", "method": "randomBytes", "data": [4]});

        assert!(dispatcher.dispatch(request(msg), 17).await.is_none());
        wait_for_queue(&dispatcher, 1).await;

        let poll = request(json!({"type": "request_async_response"}));
        let (call_id, body) = decode(&dispatcher.dispatch(poll.clone(), 0).await.unwrap());
        assert_eq!(call_id, 17);
        assert_eq!(body["result"].as_str().unwrap().len(), 8);

        // Drained: the next poll gets the empty sentinel.
        let frame = dispatcher.dispatch(poll, 0).await.unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(decode(&frame).0, 0);
    }

    #[tokio::test]
    async fn test_unknown_api_and_method() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);

        let msg = json!({"type": "api", "api": "gpu", "method": "draw", "data": []});
        let (_, body) = decode(&dispatcher.dispatch(request(msg), 0).await.unwrap());
        assert_eq!(body["error"]["code"], "EUNHANDLEDAPI");
        assert!(body["error"]["message"].as_str().unwrap().contains("gpu"));

        let msg = json!({"type": "api", "api": "fs", "method": "chownSync", "data": []});
        let (_, body) = decode(&dispatcher.dispatch(request(msg), 0).await.unwrap());
        assert_eq!(body["error"]["code"], "EUNHANDLEDMETHOD");
        assert!(body["error"]["message"].as_str().unwrap().contains("chown"));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);

        let frame = dispatcher
            .dispatch(Bytes::from_static(b"{oops"), 0)
            .await
            .unwrap();
        assert_eq!(decode(&frame).1["error"]["code"], "EPROTO");

        // Asynchronous senders get nothing queued.
        assert!(dispatcher.dispatch(Bytes::from_static(b"{oops"), 5).await.is_none());
        assert!(dispatcher.queue().is_empty());
        assert_eq!(dispatcher.queue().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_negative_call_id_dropped() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);
        let msg = json!({"type": "api", "api": "crypto", "method": "randomBytes", "data": [1]});

        assert!(dispatcher.dispatch(request(msg), u32::MAX).await.is_none());
        assert!(dispatcher.queue().is_empty());
        assert_eq!(dispatcher.queue().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_refusal_waits_for_poll() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 1);
        let msg = json!({"type": "api", "api": "crypto", "method": "randomBytes", "data": [1], "callback": "r2"});

        assert!(dispatcher.dispatch(request(msg.clone()), 1).await.is_none());
        assert!(dispatcher.dispatch(request(msg), 2).await.is_none());

        // A sync call right after still gets its own reply.
        let sync_call = json!({"type": "api", "api": "crypto", "method": "randomBytesSync", "data": [2]});
        let (call_id, body) = decode(&dispatcher.dispatch(request(sync_call), 0).await.unwrap());
        assert_eq!(call_id, 0);
        assert_eq!(body["result"].as_str().unwrap().len(), 4);

        let poll = request(json!({"type": "request_async_response"}));
        let (call_id, body) = decode(&dispatcher.dispatch(poll.clone(), 0).await.unwrap());
        assert_eq!(call_id, 2);
        assert_eq!(body["error"]["code"], "EQUEUEFULL");
        assert_eq!(body["callback"], "r2");

        wait_for_queue(&dispatcher, 1).await;
        let (call_id, body) = decode(&dispatcher.dispatch(poll, 0).await.unwrap());
        assert_eq!(call_id, 1);
        assert_eq!(body["error"], Value::Null);
    }

    #[tokio::test]
    async fn test_poll_never_runs_host_operation() {
        let dispatcher = dispatcher_at(PathBuf::from("."), 4);
        let poll = json!({"type": "request_async_response", "api": "net", "method": "socket", "data": [2, 1, 0]});

        let frame = dispatcher.dispatch(request(poll), 0).await.unwrap();
        assert!(frame.payload.is_empty());
        assert!(dispatcher.state().sockets().is_empty());
    }
}
