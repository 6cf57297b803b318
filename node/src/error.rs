//! Error kinds raised by the node, grouped the way callers react to them.

use crate::network_client::ConnId;

/// Durable store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed client input. Answered with a failure response, never logged.
    #[error("{0}")]
    Validation(String),

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Connection-level failures. The connection is purged from every table.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("connection {0} is closed")]
    Closed(ConnId),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("catalog request failed: {0}")]
    Http(String),

    #[error("catalog returned status {0}")]
    Status(u16),

    #[error("catalog response is not valid json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no live peer registered for project {0}")]
    NoPeer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no route towards position {0}")]
    NoRoute(u32),

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
