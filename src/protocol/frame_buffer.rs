//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `AwaitHeader`: Need at least 12 bytes
//! - `AwaitBody`: Header validated, need N more payload bytes
//! - `Desynchronized`: Bad header seen; the stream has no resync marker
//!
//! # Example
//!
//! ```
//! use sandbox_passthrough::protocol::{encode_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = encode_frame(0, b"{}");
//!
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames[0].payload(), b"{}");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{PassthroughError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 12 bytes).
    AwaitHeader,
    /// Header parsed, waiting for payload bytes.
    AwaitBody { header: Header },
    /// A header failed validation; every later push fails too.
    Desynchronized,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from channel reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 16MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::AwaitHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push. Several
    /// frames in one delivery are all returned, in order.
    ///
    /// # Errors
    ///
    /// Returns `PassthroughError::Protocol` on bad magic or an oversize
    /// payload. The buffer stays desynchronized afterwards; the caller
    /// should close the channel.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        if matches!(self.state, State::Desynchronized) {
            return Err(PassthroughError::protocol("Frame stream desynchronized"));
        }

        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::AwaitHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Some(header) => header,
                        None => return Ok(None),
                    };

                    if let Err(e) = header.validate(self.max_payload_size) {
                        self.state = State::Desynchronized;
                        self.buffer.clear();
                        return Err(e);
                    }

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }

                    self.state = State::AwaitBody { header };
                }

                State::AwaitBody { header } => {
                    let remaining = header.payload_length as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::AwaitHeader;

                    return Ok(Some(Frame::new(header, payload)));
                }

                State::Desynchronized => {
                    return Err(PassthroughError::protocol("Frame stream desynchronized"))
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitHeader => "AwaitHeader",
            State::AwaitBody { .. } => "AwaitBody",
            State::Desynchronized => "Desynchronized",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    fn three_frames() -> Vec<u8> {
        let mut combined = Vec::new();
        combined.extend(encode_frame(0, b"first"));
        combined.extend(encode_frame(2, b""));
        combined.extend(encode_frame(3, b"third frame payload"));
        combined
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&encode_frame(42, b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 42);
        assert_eq!(frames[0].payload(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&three_frames()).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].call_id(), 0);
        assert!(frames[1].is_empty());
        assert_eq!(frames[2].payload(), b"third frame payload");
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = encode_frame(42, b"test");

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "AwaitHeader");

        let frames = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 42);
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = encode_frame(1, payload);

        let partial = HEADER_SIZE + 10;
        assert!(buffer.push(&bytes[..partial]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "AwaitBody");

        let frames = buffer.push(&bytes[partial..]).unwrap();
        assert_eq!(frames[0].payload(), payload);
        assert_eq!(buffer.state_name(), "AwaitHeader");
    }

    #[test]
    fn test_byte_at_a_time_matches_single_delivery() {
        let bytes = three_frames();

        let mut whole = FrameBuffer::new();
        let expected: Vec<_> = whole
            .push(&bytes)
            .unwrap()
            .into_iter()
            .map(|f| f.into_parts())
            .collect();

        let mut trickle = FrameBuffer::new();
        let mut actual = Vec::new();
        for byte in &bytes {
            actual.extend(trickle.push(&[*byte]).unwrap().into_iter().map(|f| f.into_parts()));
        }

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_uneven_chunks() {
        let bytes = three_frames();
        let mut buffer = FrameBuffer::new();
        let mut count = 0;
        for chunk in bytes.chunks(7) {
            count += buffer.push(chunk).unwrap().len();
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_bad_magic_fails_fast() {
        let mut bytes = encode_frame(0, b"{}");
        bytes[3] = 0x00;

        let mut buffer = FrameBuffer::new();
        let err = buffer.push(&bytes).unwrap_err();
        assert!(matches!(err, PassthroughError::Protocol(_)));
        assert_eq!(buffer.state_name(), "Desynchronized");

        // Even a well-formed frame is refused once desynchronized.
        assert!(buffer.push(&encode_frame(0, b"{}")).is_err());
    }

    #[test]
    fn test_bad_magic_after_good_frame_reports_error() {
        let mut bytes = encode_frame(0, b"ok");
        bytes.extend_from_slice(&[0u8; HEADER_SIZE]);

        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&bytes).is_err());
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = Header::new(42, 1000);

        let result = buffer.push(&header.encode());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = encode_frame(42, b"test");
        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "AwaitBody");

        buffer.clear();

        assert_eq!(buffer.state_name(), "AwaitHeader");
        assert!(buffer.is_empty());
    }
}
