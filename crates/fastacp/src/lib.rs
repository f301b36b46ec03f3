//! FastACP: a cancel-correct JSON-RPC runtime for the Agent Client Protocol.
//!
//! Either side of an ACP connection (agent or client) is a [`Protocol`]
//! engine over a [`Transport`]. Both sides may send and serve requests at
//! the same time; cancellation flows in both directions.
//!
//! # Quick Start
//!
//! ```ignore
//! use fastacp::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ProtocolError> {
//!     let agent = Protocol::new(LineTransport::stdio());
//!     agent.set_typed_request_handler(methods::INITIALIZE, |_ctx, req: InitializeRequest| async move {
//!         Ok(InitializeResponse {
//!             protocol_version: req.protocol_version,
//!             agent_capabilities: AgentCapabilities::default(),
//!             auth_methods: Vec::new(),
//!             meta: None,
//!         })
//!     });
//!     agent.start()?;
//!     agent.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! # Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `fastacp-core` | error model, logging targets, configuration |
//! | `fastacp-protocol` | JSON-RPC messages, ACP schema subset |
//! | `fastacp-transport` | line (NDJSON) and WebSocket transports |
//! | `fastacp-rpc` | engine, extensions, sessions, pagination |

#![forbid(unsafe_code)]

pub mod testing;

pub use fastacp_core::{
    AcpError, AcpResult, ErrorCode, LoggingConfig, PaginationConfig, ProtocolConfig, config,
    logging,
};
pub use fastacp_protocol::{
    DecodeError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    schema,
};
pub use fastacp_rpc::{
    CancelOrigin, Cancellation, ExtensibleSession, Extension, ExtensionError, ExtensionLookup,
    ExtensionProxy, ExtensionRegistrar, ExtensionSet, HandlerError, HandlerResult,
    LocalExtension, NotificationContext, PaginatedRequest, PaginationError, Paginator, PromptTurn,
    Protocol, ProtocolError, ProtocolState, RemoteExtension, RemoteExtensions, RequestContext,
    RpcCallError, Session, SessionError, SessionExtensions, SessionResolver, SessionTable,
    TurnEvent,
};
pub use fastacp_transport::{
    CloseReason, FrameTransport, LineTransport, Transport, TransportError, websocket,
};

/// Prelude for the common imports.
pub mod prelude {
    pub use crate::schema::methods;
    pub use crate::schema::{
        AgentCapabilities, AuthenticateRequest, AuthenticateResponse, ClientCapabilities,
        InitializeRequest, InitializeResponse, ListSessionsRequest, ListSessionsResponse,
        NewSessionRequest, NewSessionResponse, SessionId, SessionInfo, StopReason,
    };
    pub use crate::{
        AcpError, CancelOrigin, ErrorCode, Extension, ExtensionProxy, ExtensionRegistrar,
        ExtensionSet, HandlerError, HandlerResult, LineTransport, LocalExtension, Paginator,
        Protocol, ProtocolConfig, ProtocolError, RemoteExtension, RemoteExtensions,
        RequestContext, RpcCallError, Session, SessionTable, Transport,
    };
}
