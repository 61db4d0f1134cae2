//! Frame reassembly.
//!
//! Reads deliver arbitrary slices of the byte stream: one read may contain
//! several frames, or only part of one. [`FrameBuffer`] collects the bytes
//! and hands out complete frames one at a time.

use crate::error::ProtocolError;
use crate::END_OF_COMMAND;

/// Accumulates bytes until an [`END_OF_COMMAND`] terminator shows up.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete frame, terminator included.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet, and
    /// [`ProtocolError::FrameTooLarge`] when the unterminated tail has grown
    /// past the configured limit.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.buffer.iter().position(|byte| *byte == END_OF_COMMAND) {
            Some(end) if end < self.max_frame_bytes => {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                Ok(Some(frame))
            }
            Some(_) => Err(ProtocolError::FrameTooLarge {
                limit: self.max_frame_bytes,
            }),
            None if self.buffer.len() >= self.max_frame_bytes => {
                Err(ProtocolError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                })
            }
            None => Ok(None),
        }
    }

    /// Number of buffered bytes not yet handed out as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits_for_terminator() {
        let mut frames = FrameBuffer::default();
        frames.extend(b"<Karfunkel>");

        assert_eq!(frames.next_frame().unwrap(), None);
        assert_eq!(frames.pending(), 11);

        frames.extend(b"</Karfunkel>\0");
        let frame = frames.next_frame().unwrap().unwrap();
        assert_eq!(frame, b"<Karfunkel></Karfunkel>\0".to_vec());
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut frames = FrameBuffer::default();
        frames.extend(b"<a/>\0<b/>\0<c");

        assert_eq!(frames.next_frame().unwrap().unwrap(), b"<a/>\0".to_vec());
        assert_eq!(frames.next_frame().unwrap().unwrap(), b"<b/>\0".to_vec());
        assert_eq!(frames.next_frame().unwrap(), None);
        assert_eq!(frames.pending(), 2);
    }

    #[test]
    fn test_frame_spanning_many_reads() {
        let mut frames = FrameBuffer::default();
        let payload = b"<Karfunkel><request type=\"Ping\" id=\"1\"/></Karfunkel>\0";

        for byte in payload.iter().take(payload.len() - 1) {
            frames.extend(&[*byte]);
            assert_eq!(frames.next_frame().unwrap(), None);
        }
        frames.extend(&payload[payload.len() - 1..]);

        assert_eq!(frames.next_frame().unwrap().unwrap(), payload.to_vec());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut frames = FrameBuffer::new(8);
        frames.extend(b"<Karfunkel>");

        assert_eq!(
            frames.next_frame(),
            Err(ProtocolError::FrameTooLarge { limit: 8 })
        );
    }

    #[test]
    fn test_small_frames_pass_under_limit() {
        let mut frames = FrameBuffer::new(8);
        frames.extend(b"<a/>\0<b/>\0");

        assert!(frames.next_frame().unwrap().is_some());
        assert!(frames.next_frame().unwrap().is_some());
    }
}
