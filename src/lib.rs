//! # sandbox-passthrough
//!
//! Host side of an RPC passthrough for sandboxed processes.
//!
//! A sandboxed program cannot touch the filesystem, the network or the
//! host's entropy source itself. It frames JSON requests on a channel to
//! this host, which performs the operation with host privileges and sends
//! the result back.
//!
//! ## Architecture
//!
//! - **Framing**: 12-byte little-endian header (magic, call id, length)
//!   followed by a JSON payload
//! - **Calling convention**: call id `0` is answered immediately; a
//!   positive call id is answered later, when the sandbox polls with
//!   `request_async_response`
//! - **Namespaces**: `fs`, `dns`, `net` (virtual sockets) and `crypto`
//!
//! Unix only: descriptors, file metadata and socket handling use the
//! Unix extensions of the standard library.
//!
//! ## Example
//!
//! ```no_run
//! use sandbox_passthrough::transport::Channel;
//! use sandbox_passthrough::PassthroughHost;
//!
//! #[tokio::main]
//! async fn main() -> sandbox_passthrough::Result<()> {
//!     let host = PassthroughHost::builder().root(".").build();
//!     let (channel, sandbox_end) = Channel::pair()?;
//!     // spawn the sandbox with `sandbox_end` as its channel descriptor
//!     # drop(sandbox_end);
//!     host.serve(channel).await
//! }
//! ```

pub mod dispatch;
pub mod error;
pub mod handler;
pub mod net;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod writer;

mod host;

pub use error::{PassthroughError, Result};
pub use host::{HostBuilder, HostConfig, PassthroughHost};
