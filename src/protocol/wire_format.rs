//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header format:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Magic    │ Call ID  │ Length   │
//! │ 4 bytes  │ 4 bytes  │ 4 bytes  │
//! │ uint32 LE│ uint32 LE│ uint32 LE│
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Little Endian, matching the native layout the
//! sandboxed runtime writes with a plain `write(2)` of its header struct.

use crate::error::{PassthroughError, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Magic value leading every frame.
pub const MAGIC: u32 = 0xC0D1_05FE;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Call id used by synchronous requests and every synchronous response.
pub const SYNC_CALL_ID: u32 = 0;

/// Highest call id the sandbox can produce; anything above is its
/// negative range reinterpreted as unsigned.
pub const MAX_CALL_ID: u32 = i32::MAX as u32;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame magic (must equal [`MAGIC`]).
    pub magic: u32,
    /// Call identifier (0 = synchronous).
    pub call_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header with the protocol magic.
    pub fn new(call_id: u32, payload_length: u32) -> Self {
        Self {
            magic: MAGIC,
            call_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use sandbox_passthrough::protocol::Header;
    ///
    /// let header = Header::new(42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[0..4], &[0xFE, 0x05, 0xD1, 0xC0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.call_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short. Does not validate the magic.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            call_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            payload_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Magic matches [`MAGIC`]
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.magic != MAGIC {
            return Err(PassthroughError::Protocol(format!(
                "Magic bytes don't match (received: {})",
                hex::encode(self.magic.to_le_bytes())
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(PassthroughError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Check if this frame belongs to a synchronous call.
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.call_id == SYNC_CALL_ID
    }
}
