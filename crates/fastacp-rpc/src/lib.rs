//! Protocol engine for FastACP.
//!
//! This crate drives JSON-RPC over any [`Transport`](fastacp_transport::Transport):
//!
//! - [`Protocol`]: request correlation, handler dispatch and two-way
//!   cancellation over `$/cancelRequest`
//! - [`extension`]: capability-negotiated, session-scoped extensions
//! - [`session`]: session objects with a one-prompt-at-a-time guard
//! - [`pagination`]: single-use cursor pagination with idle eviction
//!
//! # Example
//!
//! ```ignore
//! use fastacp_rpc::Protocol;
//! use fastacp_transport::LineTransport;
//!
//! let protocol = Protocol::new(LineTransport::stdio());
//! protocol.set_request_handler("test/echo", |_ctx, params| async move {
//!     Ok(params.unwrap_or_default())
//! });
//! protocol.start()?;
//! protocol.closed().await;
//! ```

#![forbid(unsafe_code)]

mod error;
mod executor;
pub mod extension;
mod handler;
pub mod pagination;
mod protocol;
pub mod session;

#[cfg(test)]
mod tests;

pub use error::{CancelOrigin, HandlerError, HandlerResult, ProtocolError, RpcCallError};
pub use extension::{
    ExtensibleSession, Extension, ExtensionError, ExtensionLookup, ExtensionProxy,
    ExtensionRegistrar, ExtensionSet, LocalExtension, RemoteExtension, RemoteExtensions,
    SessionExtensions, SessionResolver,
};
pub use handler::{
    BoxFuture, Cancellation, NotificationContext, NotificationHandler, RequestContext,
    RequestHandler,
};
pub use pagination::{PaginatedRequest, PaginationError, Paginator};
pub use protocol::{CLOSED_REASON, Protocol, ProtocolState};
pub use session::{PromptTurn, Session, SessionError, SessionTable, TurnEvent};
