//! Incremental framer for the Meshtastic serial/TCP stream API.
//!
//! Frames on the link look like:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Radios interleave plain debug text with frames on the same port, so anything before a
//! frame start is skipped silently. A header is reported once as malformed, and the framer
//! resynchronises one byte past its start, when:
//!
//! - the declared length is zero or above the limit,
//! - the payload does not decode,
//! - a complete, decodable frame starts inside the payload and either ends before the
//!   payload is complete or runs past its end (a truncated header swallowing the next
//!   frame).
use bytes::{Buf, BytesMut};

use crate::errors::CodecError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;

/// Default maximum payload length accepted by the firmware
pub const DEFAULT_MAX_FRAME_LEN: usize = 512;

pub struct StreamFramer {
    buf: BytesMut,
    max_len: usize,
    skipped: u64,
}

impl StreamFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_len,
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total noise bytes dropped while hunting for a frame start
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pull the next complete frame payload. `None` means more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, CodecError>> {
        self.next_frame_with(|payload| Ok(payload.to_vec()))
    }

    /// Pull the next frame and decode its payload with `decode`. Only frames that decode are
    /// consumed whole.
    pub fn next_frame_with<T>(
        &mut self,
        mut decode: impl FnMut(&[u8]) -> Result<T, CodecError>,
    ) -> Option<Result<T, CodecError>> {
        loop {
            // Realign to a frame start
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.skipped += pos as u64;
                    self.buf.advance(pos);
                }
                None => {
                    self.skipped += self.buf.len() as u64;
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                // Lone 0x94 inside debug text
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared = declared_len(&self.buf, 0);
            if declared == 0 || declared > self.max_len {
                self.buf.advance(1);
                return Some(Err(CodecError::Malformed(format!(
                    "declared length {} outside 1..={}",
                    declared, self.max_len
                ))));
            }
            let end = HEADER_LEN + declared;
            // A decodable frame that starts inside this payload and is complete before it
            // (or runs past it) means this header's length prefix was cut short
            let incomplete = self.buf.len() < end;
            let min_end = if incomplete { 0 } else { end + 1 };
            if self.frame_inside(declared, min_end, &mut decode) {
                self.buf.advance(1);
                return Some(Err(CodecError::Malformed(format!(
                    "header declares {} bytes but a new frame starts inside them",
                    declared
                ))));
            }
            if incomplete {
                return None;
            }

            return match decode(&self.buf[HEADER_LEN..end]) {
                Ok(frame) => {
                    self.buf.advance(end);
                    Some(Ok(frame))
                }
                Err(e) => {
                    self.buf.advance(1);
                    Some(Err(e))
                }
            };
        }
    }

    /// Whether a complete frame that decodes starts within the first `declared` payload bytes
    /// of the frame at the front of the buffer and ends at or after `min_end`.
    fn frame_inside<T>(
        &self,
        declared: usize,
        min_end: usize,
        decode: &mut impl FnMut(&[u8]) -> Result<T, CodecError>,
    ) -> bool {
        let buf = &self.buf[..];
        let last_start = (HEADER_LEN + declared).min(buf.len().saturating_sub(HEADER_LEN - 1));
        (2..last_start).any(|at| {
            if buf[at] != START1 || buf[at + 1] != START2 {
                return false;
            }
            let len = declared_len(buf, at);
            len != 0
                && len <= self.max_len
                && at + HEADER_LEN + len >= min_end
                && buf.len() >= at + HEADER_LEN + len
                && decode(&buf[at + HEADER_LEN..at + HEADER_LEN + len]).is_ok()
        })
    }

    /// Wrap a payload in a frame header.
    pub fn frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        if payload.len() > max_len || payload.len() > u16::MAX as usize {
            return Err(CodecError::TooLarge {
                len: payload.len(),
                max: max_len,
            });
        }
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(START1);
        out.push(START2);
        out.push(((payload.len() >> 8) & 0xFF) as u8);
        out.push((payload.len() & 0xFF) as u8);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

fn declared_len(buf: &[u8], at: usize) -> usize {
    ((buf[at + 2] as usize) << 8) | (buf[at + 3] as usize)
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_pushes() {
        let bytes = StreamFramer::frame(&[1, 2, 3, 4, 5], 512).unwrap();
        let mut f = StreamFramer::default();
        f.push(&bytes[..3]);
        assert!(f.next_frame().is_none());
        f.push(&bytes[3..6]);
        assert!(f.next_frame().is_none());
        f.push(&bytes[6..]);
        assert_eq!(f.next_frame(), Some(Ok(vec![1, 2, 3, 4, 5])));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn debug_text_is_skipped() {
        let mut f = StreamFramer::default();
        f.push(b"INFO  | ??:??:?? 2 Power on\r\n");
        f.push(&StreamFramer::frame(&[9, 9], 512).unwrap());
        assert_eq!(f.next_frame(), Some(Ok(vec![9, 9])));
        assert!(f.skipped() > 0);
    }

    #[test]
    fn oversize_header_reports_malformed_then_recovers() {
        let mut f = StreamFramer::new(512);
        f.push(&[START1, START2, 0x7F, 0xFF]);
        f.push(&StreamFramer::frame(&[7], 512).unwrap());
        assert!(matches!(f.next_frame(), Some(Err(CodecError::Malformed(_)))));
        assert_eq!(f.next_frame(), Some(Ok(vec![7])));
    }

    #[test]
    fn truncated_length_prefix_does_not_swallow_next_frame() {
        let mut f = StreamFramer::default();
        // Length bytes cut short: 00 94 reads as 148
        f.push(&[START1, START2, 0x00]);
        f.push(&StreamFramer::frame(&[3, 4, 5], 512).unwrap());
        assert!(matches!(f.next_frame(), Some(Err(CodecError::Malformed(_)))));
        assert_eq!(f.next_frame(), Some(Ok(vec![3, 4, 5])));
        assert!(f.next_frame().is_none());
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn undecodable_payload_is_rescanned() {
        let mut f = StreamFramer::default();
        let inner = StreamFramer::frame(&[8], 512).unwrap();
        let mut outer = vec![START1, START2, 0x00, inner.len() as u8 + 1, 0xEE];
        outer.extend_from_slice(&inner);
        f.push(&outer);
        let reject_ee = |p: &[u8]| {
            if p.first() == Some(&0xEE) {
                Err(CodecError::Malformed("bad".into()))
            } else {
                Ok(p.to_vec())
            }
        };
        assert!(matches!(f.next_frame_with(reject_ee), Some(Err(CodecError::Malformed(_)))));
        assert_eq!(f.next_frame_with(reject_ee), Some(Ok(vec![8])));
    }

    #[test]
    fn start_bytes_inside_a_complete_payload_are_data() {
        let payload = [START1, START2, 0x00, 0x01, 0x42, 0x10];
        let mut f = StreamFramer::default();
        f.push(&StreamFramer::frame(&payload, 512).unwrap());
        assert_eq!(f.next_frame(), Some(Ok(payload.to_vec())));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn zero_length_is_malformed() {
        let mut f = StreamFramer::default();
        f.push(&[START1, START2, 0, 0]);
        assert!(matches!(f.next_frame(), Some(Err(CodecError::Malformed(_)))));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn frame_rejects_oversize_payload() {
        let payload = vec![0u8; 600];
        assert_eq!(
            StreamFramer::frame(&payload, 512),
            Err(CodecError::TooLarge { len: 600, max: 512 })
        );
    }
}
