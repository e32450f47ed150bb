//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use sandbox_passthrough::protocol::{Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::new(42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the call ID.
    #[inline]
    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Check if the frame carries nothing (padding or an empty poll reply).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Split into `(payload, call_id)`.
    #[inline]
    pub fn into_parts(self) -> (Bytes, u32) {
        (self.payload, self.header.call_id)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use sandbox_passthrough::protocol::{build_frame, Header};
///
/// let header = Header::new(0, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 12 + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Encode `(call_id, payload)` into a frame, deriving the length field.
pub fn encode_frame(call_id: u32, payload: &[u8]) -> Vec<u8> {
    build_frame(&Header::new(call_id, payload.len() as u32), payload)
}
