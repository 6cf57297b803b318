//! Join protocol, finger maintenance and predecessor takeover.

use serde_json::Value;

use chordkv_lib::dht_messages::{Frame, NodeId, Request, Response};
use chordkv_lib::{is_between, key_position};

use crate::error::NodeError;
use crate::network_client::{ConnId, NetworkClient};
use crate::node::{ChordNode, HandOff, JoinState};
use crate::ring::RingLink;

impl<T: NetworkClient> ChordNode<T> {
    /// Becomes the only node of a new ring.
    pub fn create_network(&mut self) {
        self.successor = None;
        self.predecessor = None;
        self.finger_table.reset_to_self();
        self.state = JoinState::Stable;
        log_info!(self.info, "Started new network. I am the only node.");
    }

    /// Joins through `bootstrap`, or starts a new ring when there is none.
    ///
    /// Only the join request is sent here; the rest of the protocol runs as
    /// replies and notifications arrive through [`ChordNode::handle_event`].
    pub async fn join(&mut self, bootstrap: Option<&str>) -> Result<(), NodeError> {
        let Some(address) = bootstrap else {
            self.create_network();
            return Ok(());
        };

        log_info!(self.info, "Attempting to join network via bootstrap node: {}", address);
        let conn = self.network_client.connect(address).await?;
        let message_id = self.message_ids.next_id();
        self.network_client.send(
            conn,
            Frame::Request(Request::Join {
                node_id: self.info.id,
                address: self.info.address.clone(),
                message_id: Some(message_id.clone()),
            }),
        )?;
        self.join.bootstrap = Some((address.to_string(), conn));
        self.join.awaiting_reply = Some(message_id);
        self.state = JoinState::Unjoined;
        Ok(())
    }

    pub fn is_stable(&self) -> bool {
        self.state == JoinState::Stable
    }

    fn own_link(&self) -> RingLink {
        RingLink::new(self.info.id, self.info.address.clone())
    }

    fn link_to(&self, node_id: NodeId, address: &str) -> RingLink {
        match self.known_connection(node_id) {
            Some(conn) => RingLink::connected(node_id, address, conn),
            None => RingLink::new(node_id, address),
        }
    }

    fn im_your_pred(&self) -> Request {
        Request::ImYourPred {
            node_id: self.info.id,
            address: self.info.address.clone(),
        }
    }

    fn im_pointing_at_you(&self) -> Request {
        Request::ImPointingAtYou {
            node_id: self.info.id,
            address: self.info.address.clone(),
        }
    }

    pub(crate) async fn on_join_reply(&mut self, conn: ConnId, response: Response) {
        let bootstrap = self.join.bootstrap.take();

        if !response.is_success() {
            let reason = response
                .message
                .unwrap_or_else(|| "join refused".to_string());
            log_error!(self.info, "Join rejected: {}", reason);
            self.rejection = Some(reason);
            return;
        }
        let (Some(node_id), Some(address)) = (response.node_id, response.address) else {
            self.rejection = Some("join reply did not name a successor".to_string());
            return;
        };

        let successor_conn = match bootstrap {
            Some((bootstrap_address, bootstrap_conn)) if bootstrap_address == address => {
                bootstrap_conn
            }
            other => {
                if let Some((_, bootstrap_conn)) = other {
                    self.purge_connection(bootstrap_conn);
                } else {
                    self.purge_connection(conn);
                }
                match self.network_client.connect(&address).await {
                    Ok(c) => c,
                    Err(e) => {
                        log_error!(self.info, "Failed to connect to successor {}: {}", address, e);
                        self.rejection = Some(e.to_string());
                        return;
                    }
                }
            }
        };

        log_info!(self.info, "Joined network. Successor: {} at {}", node_id, address);
        let successor = RingLink::connected(node_id, address, successor_conn);
        self.peers.insert(node_id, successor_conn);

        // Every slot whose target falls in (self, successor] belongs to it.
        for slot in 0..self.finger_table.len() {
            let covered = self
                .finger_table
                .target(slot)
                .is_some_and(|t| is_between(&t, &self.info.id, &node_id));
            if covered {
                self.finger_table.set_owner(slot, successor.clone());
            }
        }
        self.successor = Some(successor);

        let request = self.im_your_pred();
        self.send_on(successor_conn, request);
        self.state = JoinState::AwaitingSuccessorAck;
    }

    pub(crate) async fn on_im_your_pred(&mut self, conn: ConnId, node_id: NodeId, address: String) {
        if node_id == self.info.id {
            return;
        }
        let sender = RingLink::connected(node_id, address.clone(), conn);
        self.peers.insert(node_id, conn);

        match self.predecessor.clone() {
            Some(old) if old.node_id == node_id => {
                self.predecessor = Some(sender);
            }
            None if self.successor.is_none() => {
                log_info!(self.info, "{} joined; ring now has two nodes", node_id);
                self.predecessor = Some(sender.clone());
                self.successor = Some(sender);
                let changed = self.update_fingers(node_id, &address, true).await;
                let request = self.im_your_pred();
                self.send_on(conn, request);
                self.handoff = Some(HandOff {
                    new_pred: node_id,
                    old_pred: None,
                });
                if changed > 0 {
                    self.push_finger_table().await;
                }
            }
            None => {
                self.predecessor = Some(sender);
                if self.state == JoinState::AwaitingSuccessorAck {
                    log_info!(self.info, "Predecessor is {}; establishing fingers", node_id);
                    self.state = JoinState::EstablishingFingers;
                    self.begin_establishment().await;
                } else {
                    log_info!(self.info, "{} re-linked as predecessor", node_id);
                    self.send_on(conn, Request::AskForFt);
                }
            }
            Some(old) => {
                log_info!(
                    self.info,
                    "{} is my new predecessor (was {})",
                    node_id,
                    old.node_id
                );
                self.tell(
                    old.node_id,
                    &old.address,
                    Request::YourNewSucc {
                        node_id,
                        address: address.clone(),
                    },
                )
                .await;
                self.predecessor = Some(sender);
                self.handoff = Some(HandOff {
                    new_pred: node_id,
                    old_pred: Some(old.node_id),
                });

                let pointers: Vec<(NodeId, String)> = self
                    .pointed_table
                    .iter()
                    .filter(|(id, _)| **id != node_id && **id != old.node_id)
                    .map(|(id, entry)| (*id, entry.address.clone()))
                    .collect();
                for (pointer_id, pointer_address) in pointers {
                    self.tell(
                        pointer_id,
                        &pointer_address,
                        Request::NewNode {
                            node_id,
                            address: address.clone(),
                        },
                    )
                    .await;
                }

                let changed = self.update_fingers(node_id, &address, true).await;
                if changed > 0 {
                    self.push_finger_table().await;
                }
                self.pred_finger_table.clear();
                self.pred_pointed_table.clear();
            }
        }
    }

    pub(crate) async fn on_your_new_succ(&mut self, node_id: NodeId, address: String) {
        if node_id == self.info.id {
            return;
        }
        log_info!(self.info, "{} is my new successor", node_id);
        self.successor = Some(self.link_to(node_id, &address));
        self.update_fingers(node_id, &address, true).await;
        let request = self.im_your_pred();
        self.tell(node_id, &address, request).await;
        self.push_tables().await;
    }

    pub(crate) async fn on_new_node(&mut self, node_id: NodeId, address: String) {
        let changed = self.update_fingers(node_id, &address, true).await;
        if changed > 0 {
            self.push_finger_table().await;
        }
    }

    /// Moves every slot for which `node_id` is a closer successor onto it.
    /// Returns the number of slots rewritten.
    pub(crate) async fn update_fingers(
        &mut self,
        node_id: NodeId,
        address: &str,
        notify: bool,
    ) -> usize {
        if node_id == self.info.id {
            return 0;
        }
        let mut changed = 0;
        for slot in 0..self.finger_table.len() {
            if !self.finger_table.slot_accepts(slot, node_id) {
                continue;
            }
            let owner = self.link_to(node_id, address);
            let previous = self.finger_table.set_owner(slot, owner);
            if let Some(previous) = previous.filter(|p| p.node_id != self.info.id) {
                self.tell(
                    previous.node_id,
                    &previous.address,
                    Request::ImNotPointingAtYou {
                        node_id: self.info.id,
                    },
                )
                .await;
            }
            if notify {
                let request = self.im_pointing_at_you();
                self.tell(node_id, address, request).await;
            }
            changed += 1;
        }
        if changed > 0 {
            log_debug!(self.info, "{} finger slots now point at {}", changed, node_id);
        }
        changed
    }

    async fn install_finger(&mut self, slot: usize, node_id: NodeId, address: String) {
        if node_id == self.info.id {
            let own = self.own_link();
            self.finger_table.set_owner(slot, own);
            return;
        }
        let owner = self.link_to(node_id, &address);
        self.finger_table.set_owner(slot, owner);
        let request = self.im_pointing_at_you();
        self.tell(node_id, &address, request).await;
    }

    async fn begin_establishment(&mut self) {
        if let Some(successor) = self.successor.clone() {
            self.install_finger(0, successor.node_id, successor.address)
                .await;
        }
        self.continue_establishment(1).await;
    }

    // Resolves slots in order until one needs a remote answer.
    async fn continue_establishment(&mut self, from_slot: usize) {
        let mut slot = from_slot;
        while let Some(target) = self.finger_table.target(slot) {
            let previous = slot
                .checked_sub(1)
                .and_then(|p| self.finger_table.owner(p))
                .filter(|o| o.node_id != self.info.id)
                .filter(|o| is_between(&target, &self.info.id, &o.node_id))
                .cloned();

            if let Some(previous) = previous {
                self.install_finger(slot, previous.node_id, previous.address)
                    .await;
            } else if self.is_responsible(target) {
                let own = self.own_link();
                self.finger_table.set_owner(slot, own);
            } else if let Some(successor) = self.successor.clone() {
                let message_id = self.message_ids.next_id();
                let request = Request::EstablishChord {
                    target_id: target,
                    message_id: Some(message_id.clone()),
                };
                match self
                    .send_to(successor.node_id, &successor.address, request)
                    .await
                {
                    Ok(()) => {
                        self.join.establishing = Some((slot, message_id));
                        return;
                    }
                    Err(e) => {
                        log_error!(self.info, "Cannot resolve finger {}: {}", slot, e);
                        let own = self.own_link();
                        self.finger_table.set_owner(slot, own);
                    }
                }
            } else {
                let own = self.own_link();
                self.finger_table.set_owner(slot, own);
            }
            slot += 1;
        }
        self.finish_establishment().await;
    }

    pub(crate) async fn on_establish_reply(&mut self, response: Response) {
        let Some((slot, _)) = self.join.establishing.take() else {
            return;
        };
        match (response.is_success(), response.node_id, response.address) {
            (true, Some(node_id), Some(address)) => {
                self.install_finger(slot, node_id, address).await;
            }
            _ => {
                log_error!(self.info, "Finger {} could not be resolved: {:?}", slot, response.message);
                let own = self.own_link();
                self.finger_table.set_owner(slot, own);
            }
        }
        self.continue_establishment(slot + 1).await;
    }

    async fn finish_establishment(&mut self) {
        self.push_tables().await;
        self.tell_successor(Request::ReadyForDataTransfer {
            node_id: self.info.id,
        })
        .await;
        if let Some(predecessor) = self.predecessor.clone() {
            self.tell(
                predecessor.node_id,
                &predecessor.address,
                Request::ChordEstablishmentCompleted {
                    node_id: self.info.id,
                },
            )
            .await;
        }
        self.state = JoinState::Stable;
        log_info!(self.info, "Finger table established; node is stable");
    }

    /// Absorbs the arc of a failed predecessor using its shadowed tables.
    pub(crate) async fn take_over(&mut self, dead: RingLink) {
        let dead_id = dead.node_id;
        log_info!(self.info, "Predecessor {} at {} failed, taking over", dead_id, dead.address);

        self.predecessor = None;
        self.peers.remove(&dead_id);
        let shadow_fingers = std::mem::take(&mut self.pred_finger_table);
        let shadow_pointed = std::mem::take(&mut self.pred_pointed_table);

        for record in &shadow_fingers {
            if record.node_id == self.info.id {
                self.pointed_table.decrement(dead_id);
            } else if record.node_id != dead_id {
                self.tell(
                    record.node_id,
                    &record.address,
                    Request::ImNotPointingAtYou { node_id: dead_id },
                )
                .await;
            }
        }
        self.pointed_table.remove(dead_id);

        let mut acks = 0;
        for record in &shadow_pointed {
            if record.node_id == self.info.id || record.node_id == dead_id {
                continue;
            }
            let request = Request::Takeover {
                old_id: dead_id,
                new_id: self.info.id,
                address: self.info.address.clone(),
            };
            match self.send_to(record.node_id, &record.address, request).await {
                Ok(()) => acks += 1,
                Err(e) => log_error!(self.info, "Takeover notice to {} failed: {}", record.node_id, e),
            }
        }

        for slot in self.finger_table.slots_owned_by(dead_id) {
            let own = self.own_link();
            self.finger_table.set_owner(slot, own);
        }
        if self.successor.as_ref().is_some_and(|s| s.node_id == dead_id) {
            log_info!(self.info, "Successor was the failed node. I am the only node.");
            self.successor = None;
            self.finger_table.reset_to_self();
        }

        // Replicas of the dead node's arc are now primaries here.
        let own_id = self.info.id;
        let adopted: Vec<(u64, Value)> = self
            .store
            .iter()
            .filter(|(key, _)| !is_between(&key_position(**key), &dead_id, &own_id))
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        for (key, value) in adopted {
            self.tell_successor(Request::InsertReplication { key, value })
                .await;
        }

        self.takeover_acks = acks;
        if acks == 0 {
            self.push_tables().await;
        }
    }

    pub(crate) async fn on_takeover(
        &mut self,
        conn: ConnId,
        old_id: NodeId,
        new_id: NodeId,
        address: String,
    ) {
        log_info!(self.info, "{} replaced failed node {}", new_id, old_id);
        if new_id != self.info.id {
            self.peers.insert(new_id, conn);
        }
        self.peers.remove(&old_id);

        let slots = self.finger_table.slots_owned_by(old_id);
        for slot in &slots {
            self.finger_table
                .set_owner(*slot, RingLink::connected(new_id, address.clone(), conn));
            if new_id != self.info.id {
                let request = self.im_pointing_at_you();
                self.send_on(conn, request);
            }
        }

        if self.successor.as_ref().is_some_and(|s| s.node_id == old_id) {
            self.successor = Some(RingLink::connected(new_id, address.clone(), conn));
            let owned: Vec<(u64, Value)> = self
                .store
                .iter()
                .filter(|(key, _)| self.is_responsible(key_position(**key)))
                .map(|(key, value)| (*key, value.clone()))
                .collect();
            for (key, value) in owned {
                self.send_on(conn, Request::InsertReplication { key, value });
            }
            let request = self.im_your_pred();
            self.send_on(conn, request);
        }

        self.pointed_table.remove(old_id);
        if !slots.is_empty() {
            self.push_finger_table().await;
        }
        self.send_on(
            conn,
            Request::Flag {
                node_id: self.info.id,
            },
        );
    }

    pub(crate) async fn on_flag(&mut self, node_id: NodeId) {
        if self.takeover_acks == 0 {
            log_debug!(self.info, "Unexpected takeover acknowledgment from {}", node_id);
            return;
        }
        self.takeover_acks -= 1;
        if self.takeover_acks == 0 {
            log_info!(self.info, "Takeover acknowledged by every pointer");
            self.push_tables().await;
        }
    }
}
