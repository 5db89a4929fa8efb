//! Engine error types

use crate::topology::NodeId;
use thiserror::Error;

/// Errors raised when wiring event handlers and streams together
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The subscription would make events flow back into their origin
    #[error("subscribing {downstream:?} to {upstream:?} would create a forwarding cycle")]
    Cycle { upstream: NodeId, downstream: NodeId },

    /// A node cannot subscribe to itself
    #[error("node {0:?} cannot subscribe to itself")]
    SelfLoop(NodeId),
}

/// Errors raised while loading an [`EngineConfig`](crate::config::EngineConfig)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;
