use std::sync::Arc;

use fastacp_core::ProtocolConfig;
use fastacp_rpc::{Protocol, ProtocolError};
use fastacp_transport::testing::{DEFAULT_PIPE_CAPACITY, LinePeer, connected_pair, line_peer};

/// A client engine and an agent engine talking to each other.
#[derive(Debug, Clone)]
pub struct TestPair {
    pub client: Protocol,
    pub agent: Protocol,
}

impl TestPair {
    /// Builds an unstarted pair with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ProtocolConfig::default())
    }

    /// Builds an unstarted pair sharing one configuration.
    #[must_use]
    pub fn with_config(config: ProtocolConfig) -> Self {
        let (client, agent) = connected_pair();
        Self {
            client: Protocol::with_config(Arc::new(client), config.clone()),
            agent: Protocol::with_config(Arc::new(agent), config),
        }
    }

    /// Builds and starts a pair. Requires a tokio runtime.
    pub fn started() -> Result<Self, ProtocolError> {
        let pair = Self::new();
        pair.start()?;
        Ok(pair)
    }

    /// Starts both engines.
    pub fn start(&self) -> Result<(), ProtocolError> {
        self.client.start()?;
        self.agent.start()
    }

    /// Closes both engines.
    pub fn close(&self) {
        self.client.close();
        self.agent.close();
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for [`TestPair::started`] returning `(client, agent)`.
pub fn started_pair() -> Result<(Protocol, Protocol), ProtocolError> {
    let pair = TestPair::started()?;
    Ok((pair.client, pair.agent))
}

/// An unstarted engine plus the raw peer at the other end of its pipe.
#[must_use]
pub fn engine_with_line_peer(config: ProtocolConfig) -> (Protocol, LinePeer) {
    let (transport, peer) = line_peer(DEFAULT_PIPE_CAPACITY);
    (Protocol::with_config(Arc::new(transport), config), peer)
}
