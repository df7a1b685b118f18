//! IRC message codec for tokio.
//!
//! Wraps [`LineCodec`] and parses lines into [`Message`] values.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::line::LineCodec;
use crate::message::Message;

/// Tokio codec for encoding/decoding IRC messages.
#[derive(Default)]
pub struct IrcCodec {
    inner: LineCodec,
}

impl IrcCodec {
    /// Create a new codec with the default line length limits.
    pub fn new() -> Self {
        Self {
            inner: LineCodec::new(),
        }
    }

    /// Sanitize outgoing message data.
    ///
    /// Rejects embedded line endings and control characters that would let a
    /// single logical message smuggle extra commands onto the wire.
    pub fn sanitize(data: &str) -> Result<()> {
        for ch in data.chars() {
            if ch == '\r' || ch == '\n' || ch == '\0' {
                return Err(ProtocolError::IllegalControlChar(ch));
            }
        }
        Ok(())
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        self.inner
            .decode(src)
            .and_then(|res| res.map_or(Ok(None), |line| line.parse::<Message>().map(Some)))
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let line = msg.to_string();
        Self::sanitize(&line)?;
        self.inner.encode(line, dst)
    }
}
