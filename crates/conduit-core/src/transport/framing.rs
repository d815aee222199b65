//! Delimiter framing for JSON messages on a byte stream.
//!
//! ```text
//! <UTF-8 JSON><delimiter><UTF-8 JSON><delimiter>...
//! ```
//!
//! Bytes are buffered until a complete delimiter-terminated chunk exists.
//! Each chunk parses independently, so one malformed chunk never poisons the
//! ones after it.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{ConduitError, Result};

/// One decoded unit from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    /// A chunk that was not valid JSON (or exceeded the size limit).
    Malformed { raw: String, error: String },
}

/// Incremental decoder for delimiter-separated JSON.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    delimiter: Vec<u8>,
    max_frame_size: usize,
    /// Dropping bytes of an oversized frame until the next delimiter.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(delimiter: impl AsRef<[u8]>, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            delimiter: delimiter.as_ref().to_vec(),
            max_frame_size: max_frame_size.max(1),
            discarding: false,
        }
    }

    /// Append bytes read from the wire.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let found = self.find_delimiter();

            if self.discarding {
                match found {
                    Some(pos) => {
                        self.buffer.advance(pos + self.delimiter.len());
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return None;
                    }
                }
            }

            let Some(pos) = found else {
                if self.buffer.len() > self.max_frame_size {
                    let preview = preview(&self.buffer);
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Frame::Malformed {
                        raw: preview,
                        error: format!("frame exceeds {} bytes", self.max_frame_size),
                    });
                }
                return None;
            };

            let chunk = self.buffer.split_to(pos);
            self.buffer.advance(self.delimiter.len());

            let trimmed = trim_ascii(&chunk);
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.len() > self.max_frame_size {
                return Some(Frame::Malformed {
                    raw: preview(trimmed),
                    error: format!("frame exceeds {} bytes", self.max_frame_size),
                });
            }

            return Some(match serde_json::from_slice::<Value>(trimmed) {
                Ok(value) => Frame::Message(value),
                Err(e) => Frame::Malformed {
                    raw: String::from_utf8_lossy(trimmed).into_owned(),
                    error: e.to_string(),
                },
            });
        }
    }

    /// Pop every complete frame currently buffered.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn find_delimiter(&self) -> Option<usize> {
        let delimiter = self.delimiter.as_slice();
        match delimiter.len() {
            0 => None,
            1 => self.buffer.iter().position(|b| *b == delimiter[0]),
            n => self.buffer.windows(n).position(|w| w == delimiter),
        }
    }
}

/// Serialize `message` and append the delimiter.
pub fn encode_frame(message: &Value, delimiter: &[u8]) -> Result<Bytes> {
    let payload = serde_json::to_vec(message)?;
    if !delimiter.is_empty() && contains(&payload, delimiter) {
        return Err(ConduitError::Validation {
            field: "message".into(),
            message: "serialized message contains the frame delimiter".into(),
        });
    }
    let mut frame = BytesMut::with_capacity(payload.len() + delimiter.len());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(delimiter);
    Ok(frame.freeze())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end.max(start)]
}

fn preview(bytes: &[u8]) -> String {
    let cut = bytes.len().min(256);
    String::from_utf8_lossy(&bytes[..cut]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_split_across_reads() {
        let mut decoder = FrameDecoder::new("\n", 1024);
        decoder.extend(br#"{"jsonrpc":"2.0","#);
        assert!(decoder.next_frame().is_none());
        decoder.extend(br#""id":1}"#);
        assert!(decoder.next_frame().is_none());
        decoder.extend(b"\n");

        assert_eq!(
            decoder.next_frame(),
            Some(Frame::Message(json!({"jsonrpc": "2.0", "id": 1})))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_messages_in_one_read_keep_order() {
        let mut decoder = FrameDecoder::new("\n", 1024);
        decoder.extend(b"{\"n\":1}\n{\"n\":2}\r\n\n{\"n\":3}\n{\"n\":");

        let frames = decoder.drain();
        assert_eq!(
            frames,
            vec![
                Frame::Message(json!({"n": 1})),
                Frame::Message(json!({"n": 2})),
                Frame::Message(json!({"n": 3})),
            ]
        );
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn test_malformed_chunk_does_not_poison_stream() {
        let mut decoder = FrameDecoder::new("\n", 1024);
        decoder.extend(b"not json\n{\"ok\":true}\n");

        match decoder.next_frame() {
            Some(Frame::Malformed { raw, .. }) => assert_eq!(raw, "not json"),
            other => panic!("expected malformed frame, got {:?}", other),
        }
        assert_eq!(decoder.next_frame(), Some(Frame::Message(json!({"ok": true}))));
    }

    #[test]
    fn test_multi_byte_delimiter() {
        let mut decoder = FrameDecoder::new("\r\n\r\n", 1024);
        decoder.extend(b"{\"a\":1}\r\n");
        assert!(decoder.next_frame().is_none());
        decoder.extend(b"\r\n{\"b\":2}\r\n\r\n");

        assert_eq!(
            decoder.drain(),
            vec![Frame::Message(json!({"a": 1})), Frame::Message(json!({"b": 2}))]
        );
    }

    #[test]
    fn test_oversized_frame_is_discarded_until_next_delimiter() {
        let mut decoder = FrameDecoder::new("\n", 16);
        decoder.extend(&[b'x'; 40]);
        assert!(matches!(decoder.next_frame(), Some(Frame::Malformed { .. })));

        decoder.extend(b"yyyy\n{\"k\":1}\n");
        assert_eq!(decoder.next_frame(), Some(Frame::Message(json!({"k": 1}))));
    }

    #[test]
    fn test_encode_appends_delimiter() {
        let frame = encode_frame(&json!({"method": "ping"}), b"\n").unwrap();
        assert_eq!(&frame[..], b"{\"method\":\"ping\"}\n");

        let mut decoder = FrameDecoder::new("\n", 1024);
        decoder.extend(&frame);
        assert_eq!(decoder.next_frame(), Some(Frame::Message(json!({"method": "ping"}))));
    }

    #[test]
    fn test_encode_rejects_payload_containing_delimiter() {
        let err = encode_frame(&json!({"text": "a|b"}), b"|").unwrap_err();
        assert!(matches!(err, ConduitError::Validation { .. }));
    }
}
