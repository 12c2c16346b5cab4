//! Newline-delimited message framing over a byte stream.
//!
//! Pure buffering and (de)serialization, no I/O. The stdio transport feeds
//! every chunk read from the child's stdout into a [`ReadBuffer`] and drains
//! complete messages from it.

use crate::errors::TransportError;
use crate::mcp::message::Message;

/// Upper bound for a single buffered line (10 MiB).
///
/// A peer that streams more than this without a terminator has its partial
/// line discarded and reported as malformed.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Accumulates partial input until a `\n` terminator is seen.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete line without its terminator, stripping a
    /// trailing `\r`. `None` means more input is needed.
    pub fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        let Some(index) = self.buffer[self.scanned..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map(|offset| self.scanned + offset)
        else {
            self.scanned = self.buffer.len();
            if self.buffer.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                self.scanned = 0;
                return Some(Err(TransportError::malformed(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes"
                ))));
            }
            return None;
        };

        let mut line: Vec<u8> = self.buffer.drain(..=index).collect();
        self.scanned = 0;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line.len() > MAX_LINE_BYTES {
            return Some(Err(TransportError::malformed(format!(
                "line exceeds {MAX_LINE_BYTES} bytes"
            ))));
        }

        Some(String::from_utf8(line).map_err(|err| TransportError::malformed(err.to_string())))
    }

    /// Returns the next complete message. A line that fails to parse yields
    /// `Some(Err(..))` and is consumed, so the caller can keep draining.
    pub fn next_message(&mut self) -> Option<Result<Message, TransportError>> {
        let line = match self.next_line()? {
            Ok(line) => line,
            Err(err) => return Some(Err(err)),
        };
        if line.trim().is_empty() {
            return Some(Err(TransportError::malformed("empty message")));
        }
        Some(Message::from_line(&line).map_err(|err| TransportError::malformed(err.to_string())))
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Serializes a message into one terminated line.
pub fn encode_line(message: &Message) -> Result<String, TransportError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
