//! Length-prefixed binary event-stream framing.
//!
//! ```text
//! [total len: u32][headers len: u32][prelude crc: u32][headers][payload][message crc: u32]
//! ```
//!
//! All integers are big-endian. Checksums are not verified; length bounds are.

use crate::stream::Decoder;
use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;

pub const PRELUDE_LEN: usize = 12;
pub const TRAILER_LEN: usize = 4;
pub const MIN_FRAME_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// String-valued headers only; other header types are skipped.
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(":message-type")
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    discarded: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes dropped while resynchronizing past corrupt prefixes.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while self.buffer.len() >= PRELUDE_LEN {
            let total_len = read_u32(&self.buffer[0..4]) as usize;
            let headers_len = read_u32(&self.buffer[4..8]) as usize;

            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
                || headers_len > total_len - MIN_FRAME_LEN
            {
                tracing::warn!(
                    total_len,
                    headers_len,
                    buffered = self.buffer.len(),
                    "corrupt event-stream prelude; resynchronizing"
                );
                self.buffer.advance(1);
                self.discarded += 1;
                continue;
            }

            if self.buffer.len() < total_len {
                break;
            }

            let frame = self.buffer.split_to(total_len);
            let headers_end = PRELUDE_LEN + headers_len;
            frames.push(Frame {
                headers: parse_headers(&frame[PRELUDE_LEN..headers_end]),
                payload: frame[headers_end..total_len - TRAILER_LEN].to_vec(),
            });
        }

        frames
    }

    /// Drop any partial frame left at end of input.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.buffer.is_empty() {
            tracing::warn!(
                remaining = self.buffer.len(),
                "event-stream ended mid-frame; discarding partial frame"
            );
            self.discarded += self.buffer.len();
            self.buffer.clear();
        }
        Vec::new()
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;

    fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        FrameDecoder::push(self, bytes)
    }

    fn finish(&mut self) -> Vec<Frame> {
        FrameDecoder::finish(self)
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Header wire types: 0/1 bool, 2 byte, 3 short, 4 int, 5 long,
/// 6 bytes, 7 string, 8 timestamp, 9 uuid.
fn parse_headers(mut raw: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    while !raw.is_empty() {
        let name_len = raw[0] as usize;
        if raw.len() < 1 + name_len + 1 {
            tracing::warn!("truncated event-stream header name");
            break;
        }
        let name = String::from_utf8_lossy(&raw[1..1 + name_len]).into_owned();
        let value_type = raw[1 + name_len];
        raw = &raw[2 + name_len..];

        let fixed = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | 7 => None,
            other => {
                tracing::warn!(value_type = other, "unknown event-stream header type");
                break;
            }
        };

        match fixed {
            Some(len) => {
                if raw.len() < len {
                    break;
                }
                raw = &raw[len..];
            }
            None => {
                if raw.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if raw.len() < 2 + len {
                    break;
                }
                if value_type == 7 {
                    let value = String::from_utf8_lossy(&raw[2..2 + len]).into_owned();
                    headers.insert(name, value);
                }
                raw = &raw[2 + len..];
            }
        }
    }
    headers
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Build a frame with string headers. Checksums are zeroed.
    pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }
        let total = super::PRELUDE_LEN + header_bytes.len() + payload.len() + super::TRAILER_LEN;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0; 4]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::encode_frame;
    use super::*;

    fn delta_frame(text: &str) -> Vec<u8> {
        let payload = serde_json::json!({ "contentBlockIndex": 0, "delta": { "text": text } });
        encode_frame(
            &[(":event-type", "contentBlockDelta"), (":message-type", "event")],
            payload.to_string().as_bytes(),
        )
    }

    fn texts(frames: &[Frame]) -> String {
        frames
            .iter()
            .map(|f| {
                let v: serde_json::Value = serde_json::from_slice(&f.payload).unwrap();
                v["delta"]["text"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn decodes_headers_and_payload() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&delta_frame("hi"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("contentBlockDelta"));
        assert_eq!(frames[0].message_type(), Some("event"));
        assert_eq!(texts(&frames), "hi");
    }

    #[test]
    fn frames_split_mid_buffer_reassemble_to_original_text() {
        let original = "The quick brown fox jumps over the lazy dog";
        let mut bytes = Vec::new();
        for word in original.split_inclusive(' ') {
            bytes.extend(delta_frame(word));
        }

        for split in [1, 5, 11, 12, 13, bytes.len() / 2, bytes.len() - 1] {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push(&bytes[..split]);
            frames.extend(decoder.push(&bytes[split..]));
            assert_eq!(texts(&frames), original, "split at {split}");
            assert_eq!(decoder.discarded(), 0);
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(texts(&frames), original);
    }

    #[test]
    fn corrupt_prefix_is_skipped_and_decoding_continues() {
        let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend(delta_frame("after"));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(texts(&frames), "after");
        assert!(decoder.discarded() > 0);
    }

    #[test]
    fn undersized_declared_length_is_treated_as_corrupt() {
        let mut bytes = vec![0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend(delta_frame("ok"));
        let mut decoder = FrameDecoder::new();
        assert_eq!(texts(&decoder.push(&bytes)), "ok");
    }

    #[test]
    fn partial_frame_at_end_is_discarded() {
        let frame = delta_frame("cut");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&frame[..frame.len() - 3]).is_empty());
        assert!(decoder.finish().is_empty());
        assert_eq!(decoder.discarded(), frame.len() - 3);
    }

    #[test]
    fn non_string_headers_are_skipped() {
        let mut headers = Vec::new();
        headers.push(4u8);
        headers.extend_from_slice(b"flag");
        headers.push(0);
        headers.push(3u8);
        headers.extend_from_slice(b"num");
        headers.push(4);
        headers.extend_from_slice(&7u32.to_be_bytes());
        headers.push(11u8);
        headers.extend_from_slice(b":event-type");
        headers.push(7);
        headers.extend_from_slice(&(8u16).to_be_bytes());
        headers.extend_from_slice(b"metadata");
        let parsed = parse_headers(&headers);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get(":event-type").map(String::as_str), Some("metadata"));
    }
}
