//! Frame buffer for accumulating partial reads.
//!
//! Byte-stream transports carry each protocol message behind a 4-byte
//! big-endian length prefix:
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ Length   │ Encoded message      │
//! │ uint32 BE│ Length bytes         │
//! └──────────┴──────────────────────┘
//! ```
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: Need at least 4 bytes
//! - `WaitingForBody`: Length parsed, need N more bytes

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted frame body (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForBody { remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: [`MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// If data is fragmented, partial data is buffered internally for the
    /// next push.
    ///
    /// # Errors
    ///
    /// Returns error if a frame exceeds the size limit.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let prefix = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

                    if length > self.max_frame_size {
                        return Err(RpcError::Protocol(format!(
                            "Frame size {} exceeds maximum {}",
                            length, self.max_frame_size
                        )));
                    }

                    self.state = State::WaitingForBody { remaining: length };
                }

                State::WaitingForBody { remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    self.state = State::WaitingForLength;
                    return Ok(Some(self.buffer.split_to(remaining).freeze()));
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
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode the length prefix for a message body.
#[inline]
pub(crate) fn length_prefix(body_len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (body_len as u32).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame_bytes(body: &[u8]) -> Vec<u8> {
        let mut bytes = length_prefix(body.len()).to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let messages = buffer.push(&make_frame_bytes(b"hello")).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut data = make_frame_bytes(b"one");
        data.extend(make_frame_bytes(b""));
        data.extend(make_frame_bytes(b"three"));

        let messages = buffer.push(&data).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"one");
        assert!(messages[1].is_empty());
        assert_eq!(&messages[2][..], b"three");
    }

    #[test]
    fn test_fragmented_frame() {
        let mut buffer = FrameBuffer::new();
        let data = make_frame_bytes(b"fragmented payload");

        assert!(buffer.push(&data[..2]).unwrap().is_empty());
        assert!(buffer.push(&data[2..7]).unwrap().is_empty());
        let messages = buffer.push(&data[7..]).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"fragmented payload");
    }

    #[test]
    fn test_trailing_partial_frame_is_kept() {
        let mut buffer = FrameBuffer::new();
        let mut data = make_frame_bytes(b"first");
        let second = make_frame_bytes(b"second");
        data.extend_from_slice(&second[..3]);

        let messages = buffer.push(&data).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(buffer.len(), 3);

        let messages = buffer.push(&second[3..]).unwrap();
        assert_eq!(&messages[0][..], b"second");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::with_max_frame_size(8);
        let result = buffer.push(&make_frame_bytes(b"way too long"));
        assert!(matches!(result, Err(RpcError::Protocol(_))));
    }
}
