//! Protocol module - wire format, framing, and the JSON envelope.
//!
//! This module implements the binary protocol spoken over the channel:
//! - 12-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Request/response envelope types

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, encode_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    ErrorPayload, MessageKind, Outcome, Response, RpcMessage, CALLBACK_TYPE,
};
pub use wire_format::{
    Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC, MAX_CALL_ID, SYNC_CALL_ID,
};
