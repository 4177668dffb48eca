//! Message framing for stream transports (TCP, TLS)

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use super::message::{parse_incremental, Parsed, MAX_MESSAGE_SIZE};
use crate::error::Result;
use crate::types::message::Message;

/// Accumulates stream segments and yields complete messages.
///
/// Segments may split a message anywhere, including inside the blank line
/// or the body. CRLF keep-alives between messages are skipped.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_message_size: usize) -> Self {
        StreamFramer {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message, if the buffer holds one.
    ///
    /// On a framing error the buffer is discarded, since the stream position
    /// can no longer be trusted.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        match parse_incremental(&self.buffer, self.max_message_size) {
            Ok(Parsed::Complete { message, consumed }) => {
                self.buffer.advance(consumed);
                debug!(consumed, remaining = self.buffer.len(), "Framed message");
                Ok(Some(message))
            }
            Ok(Parsed::Incomplete) => {
                if self.buffer.iter().all(|b| *b == b'\r' || *b == b'\n') {
                    self.buffer.clear();
                }
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Discarding stream buffer");
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Drain every complete message currently buffered
    pub fn drain(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Bytes buffered but not yet framed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
