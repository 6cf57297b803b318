use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dht_messages::{FingerRecord, NodeId, PointedRecord};

/// A ring neighbour as seen by the reporting node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub address: String,
    /// Whether a live connection to the peer is currently held.
    pub connected: bool,
}

/// Read-only view of a node's ring state.
///
/// Published by the event loop after every handled event and consumed by
/// the diagnostic logger and the HTTP status endpoint, neither of which
/// may touch the live tables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RingSnapshot {
    pub node_id: NodeId,
    pub address: String,

    /// Join state machine position (`Unjoined`, `Stable`, ...).
    pub state: String,

    pub predecessor: Option<PeerSummary>,
    pub successor: Option<PeerSummary>,

    pub finger_table: Vec<FingerRecord>,
    pub pointed_table: Vec<PointedRecord>,

    /// The number of key-value pairs stored locally, replicas included.
    pub local_key_count: u64,

    /// Forwarded requests still waiting for their reply.
    pub pending_messages: u64,

    pub open_connections: u32,

    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

impl Default for RingSnapshot {
    fn default() -> Self {
        Self {
            node_id: 0,
            address: String::new(),
            state: "Unjoined".to_string(),
            predecessor: None,
            successor: None,
            finger_table: Vec::new(),
            pointed_table: Vec::new(),
            local_key_count: 0,
            pending_messages: 0,
            open_connections: 0,
            uptime: Duration::from_millis(0),
        }
    }
}
