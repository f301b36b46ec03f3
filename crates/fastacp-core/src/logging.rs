//! Structured logging for FastACP.
//!
//! All FastACP crates log through the standard [`log`] facade. The library
//! never installs a logger; applications initialize their preferred backend
//! (`env_logger`, `simple_logger`, ...).
//!
//! # Log Levels
//!
//! - **error**: transport terminated by an I/O failure
//! - **warn**: orphaned responses, replaced pending entries, rejected cursors
//! - **info**: engine lifecycle (start, close)
//! - **debug**: dispatch flow, handler invocations, cancellations
//! - **trace**: wire-level lines and frames
//!
//! # Log Targets
//!
//! - `fastacp`: root target
//! - `fastacp::protocol`: engine lifecycle and outgoing requests
//! - `fastacp::dispatch`: incoming message classification and routing
//! - `fastacp::handler`: request/notification handler execution
//! - `fastacp::transport`: line and frame transports
//! - `fastacp::codec`: encoding and decoding
//! - `fastacp::session`: session creation and prompt turns
//! - `fastacp::extension`: capability negotiation
//! - `fastacp::pagination`: cursor lifecycle
//!
//! Example filter: `RUST_LOG=fastacp::dispatch=debug,fastacp::transport=trace`

pub use log::{debug, error, info, trace, warn};
pub use log::{Level, LevelFilter};

/// Log targets used by FastACP components.
pub mod targets {
    /// Root target for all FastACP logs.
    pub const FASTACP: &str = "fastacp";

    /// Engine lifecycle and outgoing request correlation.
    pub const PROTOCOL: &str = "fastacp::protocol";

    /// Incoming message classification and routing.
    pub const DISPATCH: &str = "fastacp::dispatch";

    /// Request and notification handler execution.
    pub const HANDLER: &str = "fastacp::handler";

    /// Transport layer (line, WebSocket).
    pub const TRANSPORT: &str = "fastacp::transport";

    /// Codec operations (JSON encoding/decoding).
    pub const CODEC: &str = "fastacp::codec";

    /// Sessions and prompt turns.
    pub const SESSION: &str = "fastacp::session";

    /// Extension capability negotiation.
    pub const EXTENSION: &str = "fastacp::extension";

    /// Pagination cursors.
    pub const PAGINATION: &str = "fastacp::pagination";
}

/// Returns whether logging is enabled at the given level for the given target.
#[inline]
#[must_use]
pub fn is_enabled(level: Level, target: &str) -> bool {
    log::log_enabled!(target: target, level)
}

/// Logs a transport event at DEBUG level.
#[macro_export]
macro_rules! log_transport {
    ($($arg:tt)*) => {
        $crate::logging::debug!(target: "fastacp::transport", $($arg)*)
    };
}

/// Logs a dispatch event at DEBUG level.
#[macro_export]
macro_rules! log_dispatch {
    ($($arg:tt)*) => {
        $crate::logging::debug!(target: "fastacp::dispatch", $($arg)*)
    };
}

/// Logs a handler execution event at DEBUG level.
#[macro_export]
macro_rules! log_handler {
    ($($arg:tt)*) => {
        $crate::logging::debug!(target: "fastacp::handler", $($arg)*)
    };
}
