//! Line-based codec for tokio.
//!
//! Reads and writes newline-terminated UTF-8 lines. Inbound bytes are decoded
//! lossily: a client must tolerate whatever encoding the remote peer emits
//! without tearing down the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Base IRC line length limit.
pub const MAX_LINE_LEN: usize = 512;

/// Line length allowance when IRCv3 message tags are in play
/// (8191 tag bytes + 512 base line).
pub const MAX_TAGGED_LINE_LEN: usize = 8191 + MAX_LINE_LEN;

/// Line-based codec that handles newline-terminated messages.
///
/// By default, lines are limited to [`MAX_TAGGED_LINE_LEN`] bytes.
pub struct LineCodec {
    /// Index of next byte to check for newline
    next_index: usize,
    /// Maximum line length
    max_len: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a new codec with the default length limit.
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_len: MAX_TAGGED_LINE_LEN,
        }
    }

    /// Create a new codec with a custom max line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let pos = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            let line = line.trim_end_matches('\r');
            if line.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }
            if line.is_empty() {
                // Blank lines carry nothing; skip to the next one.
                return self.decode(src);
            }
            Ok(Some(line.to_string()))
        } else if src.len() > self.max_len {
            // No newline within the limit; drop the runaway buffer so one
            // oversized line cannot wedge the stream.
            let actual = src.len();
            src.advance(actual);
            self.next_index = 0;
            Err(ProtocolError::MessageTooLong {
                actual,
                limit: self.max_len,
            })
        } else {
            self.next_index = src.len();
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(line.len() + 2);
        dst.put(line.as_bytes());
        dst.put(&b"\r\n"[..]);
        Ok(())
    }
}
