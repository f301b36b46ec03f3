//! Transport layer for FastACP.
//!
//! This crate provides the [`Transport`] contract consumed by the protocol
//! engine and two implementations:
//!
//! - [`LineTransport`]: newline-delimited JSON over any async byte stream
//!   (stdio, pipes, in-memory duplex)
//! - [`FrameTransport`]: one JSON-RPC message per WebSocket text frame
//!
//! # Pumping model
//!
//! `start()` spawns a reader task and a writer task on the current tokio
//! runtime. `send()` only enqueues onto an unbounded queue, so callers are
//! never slowed down by a slow peer. Incoming messages are delivered on a
//! single stream in arrival order.
//!
//! Decode failures are reported to the error observers and skipped. I/O
//! failures terminate the transport. The incoming stream ends as soon as
//! the reader stops; the writer then drains what it can within
//! [`DRAIN_TIMEOUT`] and the close observers fire exactly once.

#![forbid(unsafe_code)]

mod codec;
pub mod line;
mod state;
pub mod testing;
pub mod websocket;

pub use codec::{Codec, CodecError};
pub use line::LineTransport;
pub use state::DRAIN_TIMEOUT;
pub use websocket::{DEFAULT_ACP_PATH, FrameTransport};

use fastacp_protocol::JsonRpcMessage;
use tokio::sync::mpsc;

/// Observer invoked for every reported transport error.
pub type ErrorObserver = Box<dyn Fn(&TransportError) + Send + Sync>;

/// Observer invoked once when the transport closes.
pub type CloseObserver = Box<dyn Fn(&CloseReason) + Send + Sync>;

/// Transport trait for sending and receiving messages.
///
/// Implementations are shared behind an `Arc` by the protocol engine, so
/// every method takes `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Begins pumping. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was already started or closed, or
    /// if no runtime is available.
    fn start(&self) -> Result<(), TransportError>;

    /// Enqueues a message for sending without waiting for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is closing.
    fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Takes the incoming message stream. Returns `None` after the first call.
    ///
    /// The stream ends when the transport closes.
    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>>;

    /// Adds an error observer. Earlier observers keep being called.
    fn on_error(&self, observer: ErrorObserver);

    /// Adds a close observer. Earlier observers keep being called.
    fn on_close(&self, observer: CloseObserver);

    /// Sets the maximum size of one encoded message in bytes.
    ///
    /// Takes effect at `start()`; later calls are ignored.
    fn set_max_message_size(&self, size: usize);

    /// Closes the transport after flushing queued messages. Idempotent.
    ///
    /// A peer that stops reading gets at most [`DRAIN_TIMEOUT`] to take the
    /// queued messages before the transport gives up on them.
    fn close(&self);

    /// Returns true once the transport has fully closed.
    fn is_closed(&self) -> bool;
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// The peer ended the stream or sent a close frame.
    Eof,
    /// An I/O failure terminated the transport.
    Failed(String),
}

impl CloseReason {
    /// Returns true if the close was cooperative rather than a failure.
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        !matches!(self, CloseReason::Failed(_))
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Eof => write!(f, "closed by peer"),
            CloseReason::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Transport error types.
#[derive(Debug)]
pub enum TransportError {
    /// Transport is closed.
    Closed,
    /// `start()` was called twice.
    AlreadyStarted,
    /// `start()` was called outside a tokio runtime.
    NoRuntime,
    /// I/O error.
    Io(std::io::Error),
    /// Codec error.
    Codec(CodecError),
    /// WebSocket protocol or handshake error.
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

impl TransportError {
    /// Returns true if this error terminates the transport.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Codec(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Transport closed"),
            TransportError::AlreadyStarted => write!(f, "Transport already started"),
            TransportError::NoRuntime => write!(f, "No tokio runtime available"),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Codec(e) => write!(f, "Codec error: {e}"),
            TransportError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Codec(e) => Some(e),
            TransportError::WebSocket(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Codec(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}
