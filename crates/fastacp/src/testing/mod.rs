//! In-memory fixtures for testing code built on FastACP.
//!
//! - [`connected_pair`]: two line transports joined by a duplex pipe
//! - [`TestPair`]: a client engine and an agent engine wired to each other
//! - [`LinePeer`]: an engine facing a raw line peer, for wire-level checks
//!
//! # Example
//!
//! ```ignore
//! let pair = TestPair::started()?;
//! pair.agent.set_request_handler("echo", |_ctx, params| async move {
//!     Ok(params.unwrap_or_default())
//! });
//! let value = pair.client.send_request("echo", Some(json!(1))).await?;
//! ```

mod pair;

pub use fastacp_transport::testing::{
    DEFAULT_PIPE_CAPACITY, DuplexLineTransport, LinePeer, connected_pair,
    connected_pair_with_capacity,
};
pub use pair::{TestPair, engine_with_line_peer, started_pair};
