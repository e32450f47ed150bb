//! Transport module - channels to the sandboxed process.
//!
//! Provides:
//! - The host end of the synchronous/asynchronous message channels
//! - The fixed descriptor layout the sandbox expects
//! - Forwarding of the sandbox's stdout/stderr

mod channel;
mod stdio;

pub use channel::{
    Channel, ASYNC_CHANNEL_FD, RESERVED_DESCRIPTORS, STDERR_FD, STDIN_FD, STDOUT_FD,
    SYNC_CHANNEL_FD,
};
pub use stdio::{forward_output, spawn_stdio_forwarding};
