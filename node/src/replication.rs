//! Successor replicas and the record hand-off to a newly inserted predecessor.

use serde_json::Value;

use chordkv_lib::dht_messages::{NodeId, Request};
use chordkv_lib::{is_between, key_position};

use crate::network_client::NetworkClient;
use crate::node::ChordNode;

impl<T: NetworkClient> ChordNode<T> {
    /// Stores a replica pushed by the predecessor. Never re-replicated.
    pub(crate) fn apply_replicated_insert(&mut self, key: u64, value: Value) {
        if let Err(e) = self.store.insert_key(key, value) {
            log_error!(self.info, "Failed to store replica of {}: {}", key, e);
        }
    }

    pub(crate) fn apply_replicated_remove(&mut self, key: u64) {
        if let Err(e) = self.store.remove_key(key) {
            log_error!(self.info, "Failed to drop replica of {}: {}", key, e);
        }
    }

    fn records_where(&self, keep: impl Fn(NodeId) -> bool) -> Vec<(u64, Value)> {
        self.store
            .iter()
            .filter(|(key, _)| keep(key_position(**key)))
            .map(|(key, value)| (*key, value.clone()))
            .collect()
    }

    /// Moves records to the new predecessor `node_id` once it is established.
    ///
    /// The new predecessor receives every record outside `(node_id, self]`:
    /// its own arc plus replicas of the arc before it. When an old
    /// predecessor existed, replicas of the old predecessor's arc are
    /// deleted here and the successor drops the replicas of the arc that
    /// just moved, keeping one primary and one replica per key.
    pub(crate) async fn on_ready_for_data_transfer(&mut self, node_id: NodeId) {
        let Some(handoff) = self.handoff.take() else {
            log_debug!(self.info, "No hand-off pending for {}", node_id);
            return;
        };
        if handoff.new_pred != node_id {
            log_debug!(
                self.info,
                "Ignoring transfer request from {}; waiting for {}",
                node_id,
                handoff.new_pred
            );
            self.handoff = Some(handoff);
            return;
        }
        let Some(new_pred) = self
            .predecessor
            .clone()
            .filter(|p| p.node_id == node_id)
        else {
            log_error!(self.info, "{} is no longer my predecessor; skipping transfer", node_id);
            return;
        };

        let own_id = self.info.id;
        let outgoing = match handoff.old_pred {
            None => self.records_where(|_| true),
            Some(_) => self.records_where(|pos| !is_between(&pos, &node_id, &own_id)),
        };
        log_info!(self.info, "Transferring {} records to {}", outgoing.len(), node_id);
        for (key, value) in outgoing {
            self.tell(
                new_pred.node_id,
                &new_pred.address,
                Request::InsertReplication { key, value },
            )
            .await;
        }

        let Some(old_pred) = handoff.old_pred else {
            return;
        };

        let stale: Vec<u64> = self
            .records_where(|pos| !is_between(&pos, &old_pred, &own_id))
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            if let Err(e) = self.store.remove_key(key) {
                log_error!(self.info, "Failed to drop handed-off record {}: {}", key, e);
            }
        }

        let successor_keeps_replicas = self
            .successor
            .as_ref()
            .is_some_and(|s| s.node_id != node_id && s.node_id != own_id);
        if successor_keeps_replicas {
            let moved: Vec<u64> = self
                .records_where(|pos| is_between(&pos, &old_pred, &node_id))
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for key in moved {
                self.tell_successor(Request::RemoveReplication { key }).await;
            }
        }
    }
}
