//! ChordKV Node Library
//!
//! Storage node of a Chord ring key-value store. It can be used both as a
//! standalone binary and as a library for integration testing.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// Node-scoped logging: every line is prefixed with `id@address`.
macro_rules! log_info {
    ($node:expr, $($arg:tt)+) => {
        log::info!("[{}] {}", $node, format_args!($($arg)+))
    };
}

macro_rules! log_error {
    ($node:expr, $($arg:tt)+) => {
        log::error!("[{}] {}", $node, format_args!($($arg)+))
    };
}

macro_rules! log_debug {
    ($node:expr, $($arg:tt)+) => {
        log::debug!("[{}] {}", $node, format_args!($($arg)+))
    };
}

pub mod api;
pub mod discovery;
pub mod error;
pub mod membership;
pub mod network_client;
pub mod node;
pub mod replication;
pub mod ring;
pub mod routing;
pub mod server;
pub mod store;

// Re-export main types for public API
pub use error::{ConfigError, DiscoveryError, NodeError, StoreError, TransportError};
pub use network_client::{ConnId, NetworkClient, NetworkEvent, RealNetworkClient};
pub use node::{ChordNode, JoinState, NodeInfo};
pub use server::NodeServer;
pub use store::DurableStore;

// Re-export from lib crate for convenience
pub use chordkv_lib::dht_messages::{Frame, NodeId, Request, Response};
pub use chordkv_lib::snapshot::RingSnapshot;

/// Configuration for a node process.
#[derive(Debug, Clone)]
pub struct Config {
    pub project: String,
    pub instance: String,
    pub host: String,
    /// TCP port for ring traffic; 0 picks a free one.
    pub port: u16,
    pub data_dir: PathBuf,
    /// Log records between checkpoint compactions.
    pub log_max_size: usize,
    pub catalog_url: String,
    pub catalog_udp: String,
    /// Status API address. Unset means `host` at the ring port plus one.
    pub api_address: Option<String>,
    pub snapshot_interval: Duration,
    /// Skips catalog discovery when set.
    pub bootstrap_address: Option<String>,
    /// Overrides the identity derived from project and instance.
    pub node_id: Option<NodeId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: "chordkv".to_string(),
            instance: "0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: PathBuf::from("."),
            log_max_size: store::DEFAULT_LOG_MAX_SIZE,
            catalog_url: "http://catalog.cse.nd.edu:9097".to_string(),
            catalog_udp: "catalog.cse.nd.edu:9097".to_string(),
            api_address: None,
            snapshot_interval: Duration::from_secs(30),
            bootstrap_address: None,
            node_id: None,
        }
    }
}

impl Config {
    /// Builds a config for `project`/`instance` from the process environment.
    pub fn from_env(project: &str, instance: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(project, instance, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(
        project: &str,
        instance: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Config {
            project: project.to_string(),
            instance: instance.to_string(),
            host: lookup("NODE_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "NODE_PORT", defaults.port)?,
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            log_max_size: parse_var(&lookup, "LOG_MAX_SIZE", defaults.log_max_size)?,
            catalog_url: lookup("CATALOG_URL").unwrap_or(defaults.catalog_url),
            catalog_udp: lookup("CATALOG_UDP").unwrap_or(defaults.catalog_udp),
            api_address: lookup("API_ADDRESS").filter(|a| !a.is_empty()),
            snapshot_interval: Duration::from_secs(parse_var(
                &lookup,
                "SNAPSHOT_INTERVAL_SECS",
                defaults.snapshot_interval.as_secs(),
            )?),
            bootstrap_address: lookup("BOOTSTRAP_ADDRESS").filter(|a| !a.is_empty()),
            node_id: lookup("NODE_ID").map(|raw| parse_node_id(&raw)).transpose()?,
        })
    }

    /// Ring identity: the override, or the hash of `"{project}_{instance}"`.
    pub fn identity(&self) -> NodeId {
        self.node_id
            .unwrap_or_else(|| chordkv_lib::node_identity(&self.project, &self.instance))
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Where the status API listens once the ring listener is bound to
    /// `ring_port`. Nodes sharing a host get distinct API ports.
    pub fn status_address(&self, ring_port: u16) -> String {
        if let Some(address) = &self.api_address {
            return address.clone();
        }
        let port = match ring_port {
            0 => 0,
            port => port.checked_add(1).unwrap_or(0),
        };
        format!("{}:{}", self.host, port)
    }
}

fn parse_value<V: FromStr>(name: &'static str, raw: &str) -> Result<V, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}

fn parse_node_id(raw: &str) -> Result<NodeId, ConfigError> {
    let id: NodeId = parse_value("NODE_ID", raw)?;
    if u64::from(id) >= chordkv_lib::RING_SIZE {
        return Err(ConfigError::Invalid {
            name: "NODE_ID",
            value: raw.to_string(),
        });
    }
    Ok(id)
}

fn parse_var<V: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: V,
) -> Result<V, ConfigError> {
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}
