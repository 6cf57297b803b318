//! Ring topology owned by one node: links to neighbours, the finger table
//! and the table of remote nodes whose fingers reference this node.

use std::collections::BTreeMap;

use chordkv_lib::dht_messages::{FingerRecord, NodeId, PointedRecord};
use chordkv_lib::{add_id_power_of_2, is_between, RING_BITS, RING_SIZE};

use crate::network_client::ConnId;

/// Whether a table entry currently has a usable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Unresolved,
    Connected(ConnId),
}

impl Link {
    pub fn conn(&self) -> Option<ConnId> {
        match self {
            Link::Unresolved => None,
            Link::Connected(conn) => Some(*conn),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RingLink {
    pub node_id: NodeId,
    pub address: String,
    pub link: Link,
}

impl RingLink {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            link: Link::Unresolved,
        }
    }

    pub fn connected(node_id: NodeId, address: impl Into<String>, conn: ConnId) -> Self {
        Self {
            node_id,
            address: address.into(),
            link: Link::Connected(conn),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FingerEntry {
    pub target_id: NodeId,
    pub owner: RingLink,
}

/// `RING_BITS` slots; slot `i` targets `(node_id + 2^i) mod RING_SIZE`.
#[derive(Debug, Clone)]
pub struct FingerTable {
    node_id: NodeId,
    address: String,
    entries: Vec<FingerEntry>,
}

fn previous_id(id: NodeId) -> NodeId {
    ((u64::from(id) + RING_SIZE - 1) % RING_SIZE) as NodeId
}

impl FingerTable {
    pub fn new(node_id: NodeId, address: &str) -> Self {
        let entries = (0..RING_BITS)
            .map(|i| FingerEntry {
                target_id: add_id_power_of_2(&node_id, i),
                owner: RingLink::new(node_id, address),
            })
            .collect();
        Self {
            node_id,
            address: address.to_string(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FingerEntry] {
        &self.entries
    }

    pub fn entry(&self, slot: usize) -> Option<&FingerEntry> {
        self.entries.get(slot)
    }

    pub fn target(&self, slot: usize) -> Option<NodeId> {
        self.entries.get(slot).map(|e| e.target_id)
    }

    pub fn owner(&self, slot: usize) -> Option<&RingLink> {
        self.entries.get(slot).map(|e| &e.owner)
    }

    /// Replaces the owner of `slot`, returning the previous one.
    pub fn set_owner(&mut self, slot: usize, owner: RingLink) -> Option<RingLink> {
        let owner = if owner.node_id == self.node_id {
            RingLink::new(self.node_id, self.address.clone())
        } else {
            owner
        };
        self.entries
            .get_mut(slot)
            .map(|entry| std::mem::replace(&mut entry.owner, owner))
    }

    /// Slot `i` is owned by the first node at or after `target_i`, so
    /// `candidate` takes the slot when it lies in `[target_i, owner)`.
    pub fn slot_accepts(&self, slot: usize, candidate: NodeId) -> bool {
        let Some(entry) = self.entries.get(slot) else {
            return false;
        };
        let owner = entry.owner.node_id;
        if candidate == owner {
            return false;
        }
        let before_target = previous_id(entry.target_id);
        if before_target == owner {
            // The owner sits right before the target, so any other node is closer.
            return true;
        }
        is_between(&candidate, &before_target, &owner)
    }

    /// Slot used to forward a request for `position`.
    pub fn next_hop_slot(&self, position: NodeId) -> usize {
        let last = self.entries.len().saturating_sub(1);
        for i in 1..self.entries.len() {
            let (Some(start), Some(end)) = (self.target(i - 1), self.target(i)) else {
                break;
            };
            if is_between(&position, &start, &end) {
                return i - 1;
            }
        }
        match self.target(last) {
            Some(last_target) if is_between(&position, &last_target, &self.node_id) => last,
            _ => 0,
        }
    }

    pub fn slots_owned_by(&self, node_id: NodeId) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.owner.node_id == node_id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Points every slot back at this node.
    pub fn reset_to_self(&mut self) {
        for entry in &mut self.entries {
            entry.owner = RingLink::new(self.node_id, self.address.clone());
        }
    }

    /// Marks every slot that used `conn` as unresolved; returns how many changed.
    pub fn clear_connection(&mut self, conn: ConnId) -> usize {
        let mut cleared = 0;
        for entry in &mut self.entries {
            if entry.owner.link == Link::Connected(conn) {
                entry.owner.link = Link::Unresolved;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn set_connection(&mut self, node_id: NodeId, conn: ConnId) {
        for entry in &mut self.entries {
            if entry.owner.node_id == node_id && node_id != self.node_id {
                entry.owner.link = Link::Connected(conn);
            }
        }
    }

    pub fn find_connection(&self, node_id: NodeId) -> Option<ConnId> {
        self.entries
            .iter()
            .filter(|e| e.owner.node_id == node_id)
            .find_map(|e| e.owner.link.conn())
    }

    pub fn to_records(&self) -> Vec<FingerRecord> {
        self.entries
            .iter()
            .map(|e| FingerRecord {
                target_id: e.target_id,
                node_id: e.owner.node_id,
                address: e.owner.address.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointedEntry {
    pub count: u32,
    pub address: String,
    pub link: Link,
}

/// Remote nodes with at least one finger slot referencing this node.
#[derive(Debug, Clone, Default)]
pub struct PointedTable {
    entries: BTreeMap<NodeId, PointedEntry>,
}

impl PointedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, node_id: NodeId, address: &str, link: Link) {
        let entry = self.entries.entry(node_id).or_insert_with(|| PointedEntry {
            count: 0,
            address: address.to_string(),
            link,
        });
        entry.count += 1;
        entry.address = address.to_string();
        if link != Link::Unresolved {
            entry.link = link;
        }
    }

    /// Drops one reference; the row disappears when it reaches zero.
    pub fn decrement(&mut self, node_id: NodeId) {
        if let Some(entry) = self.entries.get_mut(&node_id) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                self.entries.remove(&node_id);
            }
        }
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<PointedEntry> {
        self.entries.remove(&node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<&PointedEntry> {
        self.entries.get(&node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PointedEntry)> {
        self.entries.iter()
    }

    pub fn clear_connection(&mut self, conn: ConnId) {
        for entry in self.entries.values_mut() {
            if entry.link == Link::Connected(conn) {
                entry.link = Link::Unresolved;
            }
        }
    }

    pub fn set_connection(&mut self, node_id: NodeId, conn: ConnId) {
        if let Some(entry) = self.entries.get_mut(&node_id) {
            entry.link = Link::Connected(conn);
        }
    }

    pub fn find_connection(&self, node_id: NodeId) -> Option<ConnId> {
        self.entries.get(&node_id).and_then(|e| e.link.conn())
    }

    pub fn to_records(&self) -> Vec<PointedRecord> {
        self.entries
            .iter()
            .map(|(node_id, e)| PointedRecord {
                node_id: *node_id,
                count: e.count,
                address: e.address.clone(),
            })
            .collect()
    }
}
