//! Line framing for streamed response bodies
//!
//! Bodies are split on the `\n` byte before any text decoding, so a
//! multi-byte character cut by a network read is reassembled by the framer
//! and never corrupted. Invalid UTF-8 becomes U+FFFD.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};

/// Longest accepted line; a longer one fails the stream
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Decodes a byte stream into text lines, without their `\n` or `\r\n`.
///
/// At end of stream an unterminated last line is still produced.
#[derive(Debug, Clone)]
pub struct SseLineCodec {
    inner: AnyDelimiterCodec,
}

impl SseLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
        }
    }
}

impl Default for SseLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_line(frame: Bytes) -> String {
    let text = String::from_utf8_lossy(&frame);
    text.strip_suffix('\r').unwrap_or(&*text).to_string()
}

impl Decoder for SseLineCodec {
    type Item = String;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        Ok(self.inner.decode(buf)?.map(to_line))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        Ok(self.inner.decode_eof(buf)?.map(to_line))
    }
}
