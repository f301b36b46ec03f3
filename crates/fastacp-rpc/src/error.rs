//! Engine-level error types.
//!
//! [`HandlerError`] is what request handlers return; the engine maps each
//! variant onto a response code. [`RpcCallError`] is what callers of
//! `send_request` see: the remote's error, a cancellation, or a local
//! engine condition, never a raw transport failure.

use std::time::Duration;

use fastacp_core::AcpError;
use fastacp_transport::TransportError;

/// Where a cancellation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// Cancelled on this side (caller gave up, bulk cancel, close, timeout).
    Local,
    /// Cancelled by the peer (a `$/cancelRequest` notification or a
    /// `CANCELLED` error response).
    Remote,
}

impl std::fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelOrigin::Local => write!(f, "local"),
            CancelOrigin::Remote => write!(f, "remote"),
        }
    }
}

/// Failure returned by a request or notification handler.
#[derive(Debug)]
pub enum HandlerError {
    /// An anticipated application failure, sent as `INVALID_PARAMS`.
    Expected(String),
    /// Params or result (de)serialization failed, sent as `PARSE_ERROR`.
    Serialization(serde_json::Error),
    /// A fully formed wire error, sent as is.
    Rpc(AcpError),
    /// The handler was interrupted.
    Cancelled(String),
    /// Anything else, sent as `INTERNAL_ERROR`.
    Internal(String),
}

/// Result type returned by request handlers.
pub type HandlerResult<T = serde_json::Value> = Result<T, HandlerError>;

impl HandlerError {
    /// Creates an expected application failure.
    #[must_use]
    pub fn expected(message: impl Into<String>) -> Self {
        HandlerError::Expected(message.into())
    }

    /// Creates an internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }

    /// Converts into the error object sent back to the caller.
    #[must_use]
    pub fn into_acp_error(self) -> AcpError {
        match self {
            HandlerError::Expected(message) => AcpError::invalid_params(message),
            HandlerError::Serialization(err) => AcpError::parse_error(err.to_string()),
            HandlerError::Rpc(err) => err,
            HandlerError::Cancelled(reason) => AcpError::cancelled(reason),
            HandlerError::Internal(message) => AcpError::internal_error(message),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Expected(message) => write!(f, "{message}"),
            HandlerError::Serialization(err) => write!(f, "Serialization error: {err}"),
            HandlerError::Rpc(err) => write!(f, "{err}"),
            HandlerError::Cancelled(reason) => write!(f, "Cancelled: {reason}"),
            HandlerError::Internal(message) => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Serialization(err) => Some(err),
            HandlerError::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Serialization(err)
    }
}

impl From<AcpError> for HandlerError {
    fn from(err: AcpError) -> Self {
        HandlerError::Rpc(err)
    }
}

impl From<RpcCallError> for HandlerError {
    fn from(err: RpcCallError) -> Self {
        match err {
            RpcCallError::Remote(err) => HandlerError::Rpc(err),
            RpcCallError::Cancelled { reason, .. } => HandlerError::Cancelled(reason),
            RpcCallError::Serialization(err) => HandlerError::Serialization(err),
            other => HandlerError::Internal(other.to_string()),
        }
    }
}

/// Failure of an outgoing request as seen by its caller.
#[derive(Debug)]
pub enum RpcCallError {
    /// The peer answered with an error other than `CANCELLED`.
    Remote(AcpError),
    /// The request was cancelled.
    Cancelled {
        /// Which side initiated the cancellation.
        origin: CancelOrigin,
        /// Human-readable reason.
        reason: String,
    },
    /// The configured request timeout elapsed.
    Timeout(Duration),
    /// The engine is closed (or closed while the request was pending).
    Closed,
    /// `start()` has not been called yet.
    NotStarted,
    /// Params or result (de)serialization failed locally.
    Serialization(serde_json::Error),
}

impl RpcCallError {
    /// Returns true for either origin of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcCallError::Cancelled { .. })
    }

    /// Returns the remote error object, if this is one.
    #[must_use]
    pub fn as_remote(&self) -> Option<&AcpError> {
        match self {
            RpcCallError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcCallError::Remote(err) => write!(f, "Remote error: {err}"),
            RpcCallError::Cancelled { origin, reason } => {
                write!(f, "Request cancelled ({origin}): {reason}")
            }
            RpcCallError::Timeout(limit) => write!(f, "Request timed out after {limit:?}"),
            RpcCallError::Closed => write!(f, "Protocol closed"),
            RpcCallError::NotStarted => write!(f, "Protocol not started"),
            RpcCallError::Serialization(err) => write!(f, "Serialization error: {err}"),
        }
    }
}

impl std::error::Error for RpcCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcCallError::Remote(err) => Some(err),
            RpcCallError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

/// Failure to start or drive the engine.
#[derive(Debug)]
pub enum ProtocolError {
    /// `start()` was called twice.
    AlreadyStarted,
    /// The engine is closed; it cannot be restarted.
    Closed,
    /// `start()` was called outside a tokio runtime.
    NoRuntime,
    /// Someone else already took the transport's incoming stream.
    IncomingTaken,
    /// The handler worker thread could not be created.
    Io(std::io::Error),
    /// The transport failed to start.
    Transport(TransportError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::AlreadyStarted => write!(f, "Protocol already started"),
            ProtocolError::Closed => write!(f, "Protocol closed"),
            ProtocolError::NoRuntime => write!(f, "No tokio runtime available"),
            ProtocolError::IncomingTaken => write!(f, "Transport incoming stream already taken"),
            ProtocolError::Io(err) => write!(f, "Handler worker error: {err}"),
            ProtocolError::Transport(err) => write!(f, "Transport error: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(err) => Some(err),
            ProtocolError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        ProtocolError::Transport(err)
    }
}
