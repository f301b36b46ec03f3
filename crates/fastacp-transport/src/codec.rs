//! Message codec for framing JSON-RPC messages.
//!
//! Stream transports use newline-delimited JSON (NDJSON); frame transports
//! carry one message per text frame. Both go through the same size limit.

use fastacp_core::config::DEFAULT_MAX_MESSAGE_SIZE;
use fastacp_core::logging::targets;
use fastacp_protocol::{DecodeError, JsonRpcMessage};

/// Threshold for compacting the buffer (bytes already consumed).
const COMPACT_THRESHOLD: usize = 4096;

/// Codec for encoding/decoding JSON-RPC messages.
#[derive(Debug)]
pub struct Codec {
    /// Buffer for incomplete lines.
    buffer: Vec<u8>,
    /// Read position in buffer (data before this has been consumed).
    read_pos: usize,
    /// Maximum allowed message size in bytes.
    max_message_size: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Codec {
    /// Creates a codec with the given message size limit.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            read_pos: 0,
            max_message_size,
            discarding: false,
        }
    }

    /// Returns the maximum allowed message size in bytes.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encodes a message as one line, including the trailing `\n`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the line exceeds the limit.
    pub fn encode_line(&self, message: &JsonRpcMessage) -> Result<Vec<u8>, CodecError> {
        let mut bytes = serde_json::to_vec(message)?;
        if bytes.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge(bytes.len()));
        }
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Encodes a message as the payload of one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the payload exceeds the limit.
    pub fn encode_text(&self, message: &JsonRpcMessage) -> Result<String, CodecError> {
        let text = fastacp_protocol::encode(message)?;
        if text.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge(text.len()));
        }
        Ok(text)
    }

    /// Decodes the payload of one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is oversized or not a JSON-RPC message.
    pub fn decode_text(&self, text: &str) -> Result<JsonRpcMessage, CodecError> {
        if text.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge(text.len()));
        }
        Ok(fastacp_protocol::decode(text)?)
    }

    /// Feeds bytes and returns one result per complete line.
    ///
    /// Incomplete data is buffered for the next call. A line that fails to
    /// decode yields an `Err` entry without affecting the lines around it;
    /// empty lines yield nothing. An unterminated line that grows past the
    /// limit is reported once and skipped up to its newline.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Result<JsonRpcMessage, CodecError>> {
        if self.read_pos >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);

        let mut results = Vec::new();
        let mut start = self.read_pos;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if self.discarding {
                self.discarding = false;
            } else if let Some(result) = self.decode_line(&self.buffer[start..end]) {
                results.push(result);
            }
            start = end + 1;
        }
        self.read_pos = start;

        let pending = self.buffer.len() - self.read_pos;
        if pending > self.max_message_size {
            if !self.discarding {
                log::debug!(target: targets::CODEC, "skipping oversized line ({} bytes so far)", pending);
                results.push(Err(CodecError::MessageTooLarge(pending)));
                self.discarding = true;
            }
            self.clear();
        }

        results
    }

    /// Decodes whatever unterminated line is left at end of input.
    pub fn finish(&mut self) -> Option<Result<JsonRpcMessage, CodecError>> {
        let result = if self.discarding {
            None
        } else {
            self.decode_line(&self.buffer[self.read_pos..])
        };
        self.clear();
        self.discarding = false;
        result
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }

    fn decode_line(&self, line: &[u8]) -> Option<Result<JsonRpcMessage, CodecError>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if line.len() > self.max_message_size {
            log::debug!(target: targets::CODEC, "rejected {}-byte line over the {}-byte limit", line.len(), self.max_message_size);
            return Some(Err(CodecError::MessageTooLarge(line.len())));
        }
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(err) => return Some(Err(CodecError::Utf8(err))),
        };
        Some(fastacp_protocol::decode(text).map_err(|err| {
            log::trace!(target: targets::CODEC, "undecodable line: {}", err);
            CodecError::Decode(err)
        }))
    }
}

/// Codec error types.
#[derive(Debug)]
pub enum CodecError {
    /// JSON serialization error.
    Json(serde_json::Error),
    /// Payload is not a JSON-RPC message.
    Decode(DecodeError),
    /// Line is not valid UTF-8.
    Utf8(std::str::Utf8Error),
    /// Message too large.
    MessageTooLarge(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "JSON error: {e}"),
            CodecError::Decode(e) => write!(f, "Decode error: {e}"),
            CodecError::Utf8(e) => write!(f, "Invalid UTF-8: {e}"),
            CodecError::MessageTooLarge(size) => write!(f, "Message too large: {size} bytes"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            CodecError::Decode(e) => Some(e),
            CodecError::Utf8(e) => Some(e),
            CodecError::MessageTooLarge(_) => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err)
    }
}

impl From<DecodeError> for CodecError {
    fn from(err: DecodeError) -> Self {
        CodecError::Decode(err)
    }
}
