use std::collections::HashMap;

use chordkv_lib::dht_messages::NodeId;

use crate::network_client::ConnId;

/// A request this node forwarded and whose reply must be relayed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub origin: ConnId,
    pub next_hop: ConnId,
    /// The id was generated here; the origin never sent one.
    pub assigned: bool,
}

/// Correlation table keyed by `message_id`.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingMessage>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message_id: String, origin: ConnId, next_hop: ConnId, assigned: bool) {
        self.entries.insert(
            message_id,
            PendingMessage {
                origin,
                next_hop,
                assigned,
            },
        );
    }

    /// Removes and returns the entry for a reply. Each reply is relayed once.
    pub fn take(&mut self, message_id: &str) -> Option<PendingMessage> {
        self.entries.remove(message_id)
    }

    /// Drops every entry whose origin or next hop was `conn`; returns how many.
    pub fn purge_connection(&mut self, conn: ConnId) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, p| p.origin != conn && p.next_hop != conn);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Generates `"{node_id}_{counter}"` correlation ids.
#[derive(Debug)]
pub struct MessageIds {
    node_id: NodeId,
    counter: u64,
}

impl MessageIds {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}_{}", self.node_id, self.counter)
    }
}
