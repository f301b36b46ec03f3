//! ACP protocol types and JSON-RPC implementation.
//!
//! This crate provides:
//! - JSON-RPC 2.0 message types
//! - A structural decoder that classifies messages by field presence
//! - The subset of ACP schema records the runtime itself needs
//!
//! # Wire Format
//!
//! One JSON-RPC object per line (stream transports) or per text frame
//! (WebSocket). Every message carries `"jsonrpc": "2.0"`.

#![forbid(unsafe_code)]

mod jsonrpc;
pub mod schema;

pub use jsonrpc::{
    DecodeError, JSONRPC_VERSION, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponsePayload, decode, empty_params, encode, to_params,
};
pub use schema::{CancelRequestParams, SessionId};
