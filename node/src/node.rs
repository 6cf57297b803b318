use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chordkv_lib::dht_messages::{FingerRecord, Frame, NodeId, PointedRecord, Request, Response};
use chordkv_lib::snapshot::{PeerSummary, RingSnapshot};
use chordkv_lib::{is_between, key_position};

use crate::error::{NodeError, StoreError, TransportError};
use crate::network_client::{ConnId, NetworkClient, NetworkEvent};
use crate::ring::{FingerTable, Link, PointedTable, RingLink};
use crate::routing::{MessageIds, PendingTable};
use crate::store::{validate_key, DurableStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Where a node is in the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    AwaitingSuccessorAck,
    EstablishingFingers,
    Stable,
}

/// Records still owed to a newly inserted predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HandOff {
    pub(crate) new_pred: NodeId,
    pub(crate) old_pred: Option<NodeId>,
}

#[derive(Debug, Default)]
pub(crate) struct JoinProgress {
    /// Bootstrap address and the connection the join request went out on.
    pub(crate) bootstrap: Option<(String, ConnId)>,
    pub(crate) awaiting_reply: Option<String>,
    /// Finger slot being resolved and the message id of its `establishChord`.
    pub(crate) establishing: Option<(usize, String)>,
}

pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub state: JoinState,
    pub successor: Option<RingLink>,
    pub predecessor: Option<RingLink>,
    pub finger_table: FingerTable,
    pub pointed_table: PointedTable,
    pub pred_finger_table: Vec<FingerRecord>,
    pub pred_pointed_table: Vec<PointedRecord>,
    pub store: DurableStore,
    pub pending: PendingTable,
    pub network_client: T,
    pub(crate) peers: HashMap<NodeId, ConnId>,
    pub(crate) message_ids: MessageIds,
    pub(crate) join: JoinProgress,
    pub(crate) handoff: Option<HandOff>,
    pub(crate) takeover_acks: usize,
    pub(crate) rejection: Option<String>,
    started: Instant,
}

impl<T: NetworkClient> ChordNode<T> {
    pub fn new(info: NodeInfo, store: DurableStore, network_client: T) -> Self {
        let finger_table = FingerTable::new(info.id, &info.address);
        let message_ids = MessageIds::new(info.id);
        ChordNode {
            info,
            state: JoinState::Unjoined,
            successor: None,
            predecessor: None,
            finger_table,
            pointed_table: PointedTable::new(),
            pred_finger_table: Vec::new(),
            pred_pointed_table: Vec::new(),
            store,
            pending: PendingTable::new(),
            network_client,
            peers: HashMap::new(),
            message_ids,
            join: JoinProgress::default(),
            handoff: None,
            takeover_acks: 0,
            rejection: None,
            started: Instant::now(),
        }
    }

    /// Set when the ring refused this node; the server loop stops on it.
    pub fn join_rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// True iff no predecessor is known or `position` is in `(predecessor, self]`.
    pub fn is_responsible(&self, position: NodeId) -> bool {
        match &self.predecessor {
            None => true,
            Some(pred) => is_between(&position, &pred.node_id, &self.info.id),
        }
    }

    // A joining node forwards everything until it has a predecessor.
    fn answers_for(&self, position: NodeId) -> bool {
        match self.state {
            JoinState::Unjoined | JoinState::AwaitingSuccessorAck if self.successor.is_some() => {
                false
            }
            _ => self.is_responsible(position),
        }
    }

    pub async fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Frame {
                conn,
                frame: Frame::Request(request),
            } => self.handle_request(conn, request).await,
            NetworkEvent::Frame {
                conn,
                frame: Frame::Response(response),
            } => self.handle_response(conn, response).await,
            NetworkEvent::Invalid { conn, reason } => {
                self.reply(conn, Response::failure(format!("Invalid request: {}", reason)));
            }
            NetworkEvent::Malformed { conn, reason } => {
                log_error!(self.info, "Closing connection {}: {}", conn, reason);
                self.drop_connection(conn).await;
            }
            NetworkEvent::Closed { conn } => self.drop_connection(conn).await,
        }
    }

    async fn handle_request(&mut self, conn: ConnId, request: Request) {
        log_debug!(self.info, "Received on {}: {:?}", conn, request);
        match request {
            Request::Insert { .. }
            | Request::Lookup { .. }
            | Request::Remove { .. }
            | Request::Join { .. }
            | Request::EstablishChord { .. } => self.handle_routed(conn, request).await,
            Request::ImYourPred { node_id, address } => {
                self.on_im_your_pred(conn, node_id, address).await
            }
            Request::YourNewSucc { node_id, address } => {
                self.on_your_new_succ(node_id, address).await
            }
            Request::ImPointingAtYou { node_id, address } => {
                if node_id != self.info.id {
                    self.pointed_table
                        .increment(node_id, &address, Link::Connected(conn));
                    self.peers.entry(node_id).or_insert(conn);
                    self.push_pointed_table().await;
                }
            }
            Request::ImNotPointingAtYou { node_id } => {
                self.pointed_table.decrement(node_id);
                self.push_pointed_table().await;
            }
            Request::ChordEstablishmentCompleted { node_id } => {
                log_info!(self.info, "Node {} finished establishing its fingers", node_id);
                self.push_tables_on(conn);
            }
            Request::NewNode { node_id, address } => self.on_new_node(node_id, address).await,
            Request::UpdatePft { finger_table } => self.pred_finger_table = finger_table,
            Request::UpdatePpt { pointed_table } => self.pred_pointed_table = pointed_table,
            Request::Takeover {
                old_id,
                new_id,
                address,
            } => self.on_takeover(conn, old_id, new_id, address).await,
            Request::Flag { node_id } => self.on_flag(node_id).await,
            Request::ReadyForDataTransfer { node_id } => {
                self.on_ready_for_data_transfer(node_id).await
            }
            Request::InsertReplication { key, value } => self.apply_replicated_insert(key, value),
            Request::RemoveReplication { key } => self.apply_replicated_remove(key),
            Request::AskForFt => self.push_tables_on(conn),
        }
    }

    fn routed_position(request: &Request) -> Result<NodeId, StoreError> {
        match request {
            Request::Insert { key, .. } | Request::Lookup { key, .. } | Request::Remove { key, .. } => {
                validate_key(key).map(key_position)
            }
            Request::Join { node_id, .. } => Ok(*node_id),
            Request::EstablishChord { target_id, .. } => Ok(*target_id),
            _ => Err(StoreError::Validation("method required".to_string())),
        }
    }

    async fn handle_routed(&mut self, conn: ConnId, request: Request) {
        let position = match Self::routed_position(&request) {
            Ok(position) => position,
            Err(e) => {
                let message_id = request.message_id().map(str::to_string);
                self.reply(conn, Response::failure(e.to_string()).with_message_id(message_id));
                return;
            }
        };

        if self.answers_for(position) {
            let message_id = request.message_id().map(str::to_string);
            let response = self.answer_locally(request).await;
            self.reply(conn, response.with_message_id(message_id));
        } else {
            self.forward(conn, request, position).await;
        }
    }

    async fn answer_locally(&mut self, request: Request) -> Response {
        match request {
            Request::Insert { key, value, .. } => match self.store.insert(&key, value.clone()) {
                Ok(key) => {
                    self.tell_successor(Request::InsertReplication { key, value })
                        .await;
                    Response::success()
                }
                Err(e) => self.store_failure(e),
            },
            Request::Lookup { key, .. } => match self.store.lookup(&key) {
                Ok(Some(value)) => Response::with_value(value.clone()),
                Ok(None) => Response::failure("Key not found"),
                Err(e) => self.store_failure(e),
            },
            Request::Remove { key, .. } => match self.store.remove(&key) {
                Ok((key, true)) => {
                    self.tell_successor(Request::RemoveReplication { key }).await;
                    Response::success()
                }
                Ok((_, false)) => Response::failure("Key not found"),
                Err(e) => self.store_failure(e),
            },
            Request::Join { node_id, address, .. } => {
                if node_id == self.info.id {
                    log_error!(self.info, "Rejecting {} at {}: identity collision", node_id, address);
                    Response::failure("Node identity collision")
                } else {
                    log_info!(self.info, "Answering join of {} at {}", node_id, address);
                    Response::peer(self.info.id, self.info.address.clone())
                }
            }
            Request::EstablishChord { .. } => {
                Response::peer(self.info.id, self.info.address.clone())
            }
            _ => Response::failure("Invalid request: method required"),
        }
    }

    fn store_failure(&self, error: StoreError) -> Response {
        if !matches!(error, StoreError::Validation(_)) {
            log_error!(self.info, "Store operation failed: {}", error);
        }
        Response::failure(error.to_string())
    }

    /// Owner of the finger slot used to reach `position`.
    pub fn next_hop(&self, position: NodeId) -> Option<(NodeId, String)> {
        let slot = self.finger_table.next_hop_slot(position);
        match self.finger_table.owner(slot) {
            Some(owner) if owner.node_id != self.info.id => {
                Some((owner.node_id, owner.address.clone()))
            }
            _ => self
                .successor
                .as_ref()
                .filter(|s| s.node_id != self.info.id)
                .map(|s| (s.node_id, s.address.clone())),
        }
    }

    async fn forward(&mut self, origin: ConnId, mut request: Request, position: NodeId) {
        let assigned = request.message_id().is_none();
        if assigned {
            request.set_message_id(self.message_ids.next_id());
        }
        let message_id = request.message_id().map(str::to_string).unwrap_or_default();
        let reply_id = (!assigned).then(|| message_id.clone());

        let Some((node_id, address)) = self.next_hop(position) else {
            let error = NodeError::NoRoute(position);
            self.reply(
                origin,
                Response::failure(error.to_string()).with_message_id(reply_id),
            );
            return;
        };

        let sent = match self.connection_to(node_id, &address).await {
            Ok(next_hop) => match self.network_client.send(next_hop, Frame::Request(request)) {
                Ok(()) => Ok(next_hop),
                Err(e) => {
                    self.purge_connection(next_hop);
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match sent {
            Ok(next_hop) => {
                log_debug!(self.info, "Forwarded {} for {} to {}", message_id, position, node_id);
                self.pending.insert(message_id, origin, next_hop, assigned);
            }
            Err(e) => {
                log_error!(self.info, "Failed to forward {} to {}: {}", message_id, node_id, e);
                self.reply(
                    origin,
                    Response::failure(NodeError::NoRoute(position).to_string())
                        .with_message_id(reply_id),
                );
            }
        }
    }

    async fn handle_response(&mut self, conn: ConnId, response: Response) {
        let Some(message_id) = response.message_id.clone() else {
            log_debug!(self.info, "Dropping uncorrelated response on {}", conn);
            return;
        };

        if let Some(pending) = self.pending.take(&message_id) {
            let response = if pending.assigned {
                response.with_message_id(None)
            } else {
                response
            };
            if let Err(e) = self
                .network_client
                .send(pending.origin, Frame::Response(response))
            {
                log_error!(self.info, "Failed to relay {}: {}", message_id, e);
            }
            return;
        }

        if self.join.awaiting_reply.as_deref() == Some(message_id.as_str()) {
            self.join.awaiting_reply = None;
            self.on_join_reply(conn, response).await;
            return;
        }

        let establishing = matches!(
            &self.join.establishing,
            Some((_, id)) if *id == message_id
        );
        if establishing {
            self.on_establish_reply(response).await;
            return;
        }

        log_debug!(self.info, "Dropping response {} with no pending entry", message_id);
    }

    pub(crate) fn reply(&mut self, conn: ConnId, response: Response) {
        if let Err(e) = self.network_client.send(conn, Frame::Response(response)) {
            log_error!(self.info, "Failed to answer on {}: {}", conn, e);
        }
    }

    /// Sends a request on an existing connection, logging failures.
    pub(crate) fn send_on(&mut self, conn: ConnId, request: Request) {
        if let Err(e) = self.network_client.send(conn, Frame::Request(request)) {
            log_error!(self.info, "Failed to send on {}: {}", conn, e);
        }
    }

    pub(crate) fn known_connection(&self, node_id: NodeId) -> Option<ConnId> {
        let open = |conn: &ConnId| self.network_client.is_open(*conn);
        self.peers
            .get(&node_id)
            .copied()
            .filter(open)
            .or_else(|| {
                [&self.successor, &self.predecessor]
                    .into_iter()
                    .flatten()
                    .filter(|l| l.node_id == node_id)
                    .find_map(|l| l.link.conn())
                    .filter(open)
            })
            .or_else(|| self.finger_table.find_connection(node_id).filter(open))
            .or_else(|| self.pointed_table.find_connection(node_id).filter(open))
    }

    pub(crate) fn remember_connection(&mut self, node_id: NodeId, conn: ConnId) {
        if node_id == self.info.id {
            return;
        }
        self.peers.insert(node_id, conn);
        let client = &self.network_client;
        for link in [&mut self.successor, &mut self.predecessor]
            .into_iter()
            .flatten()
        {
            let stale = link.link.conn().map_or(true, |c| !client.is_open(c));
            if link.node_id == node_id && stale {
                link.link = Link::Connected(conn);
            }
        }
        self.finger_table.set_connection(node_id, conn);
        self.pointed_table.set_connection(node_id, conn);
    }

    /// Reuses any open connection to `node_id` or dials `address`.
    pub(crate) async fn connection_to(
        &mut self,
        node_id: NodeId,
        address: &str,
    ) -> Result<ConnId, TransportError> {
        if let Some(conn) = self.known_connection(node_id) {
            return Ok(conn);
        }
        let conn = self.network_client.connect(address).await?;
        self.remember_connection(node_id, conn);
        Ok(conn)
    }

    pub(crate) async fn send_to(
        &mut self,
        node_id: NodeId,
        address: &str,
        request: Request,
    ) -> Result<(), TransportError> {
        let conn = self.connection_to(node_id, address).await?;
        if let Err(e) = self.network_client.send(conn, Frame::Request(request)) {
            self.purge_connection(conn);
            return Err(e);
        }
        Ok(())
    }

    /// Fire-and-forget send to a peer; never sends to this node itself.
    pub(crate) async fn tell(&mut self, node_id: NodeId, address: &str, request: Request) {
        if node_id == self.info.id {
            return;
        }
        if let Err(e) = self.send_to(node_id, address, request).await {
            log_error!(self.info, "Failed to reach {} at {}: {}", node_id, address, e);
        }
    }

    pub(crate) async fn tell_successor(&mut self, request: Request) {
        if let Some(successor) = self.successor.clone() {
            self.tell(successor.node_id, &successor.address, request)
                .await;
        }
    }

    pub(crate) async fn push_finger_table(&mut self) {
        let finger_table = self.finger_table.to_records();
        self.tell_successor(Request::UpdatePft { finger_table }).await;
    }

    pub(crate) async fn push_pointed_table(&mut self) {
        let pointed_table = self.pointed_table.to_records();
        self.tell_successor(Request::UpdatePpt { pointed_table }).await;
    }

    pub(crate) async fn push_tables(&mut self) {
        self.push_finger_table().await;
        self.push_pointed_table().await;
    }

    /// Answers a shadow refresh on the connection the request arrived on.
    pub(crate) fn push_tables_on(&mut self, conn: ConnId) {
        let finger_table = self.finger_table.to_records();
        let pointed_table = self.pointed_table.to_records();
        self.send_on(conn, Request::UpdatePft { finger_table });
        self.send_on(conn, Request::UpdatePpt { pointed_table });
    }

    /// Forgets `conn` everywhere: links become unresolved and pending relays are dropped.
    pub(crate) fn purge_connection(&mut self, conn: ConnId) {
        let dropped = self.pending.purge_connection(conn);
        if dropped > 0 {
            log_debug!(self.info, "Dropped {} pending relays on {}", dropped, conn);
        }
        for link in [&mut self.successor, &mut self.predecessor]
            .into_iter()
            .flatten()
        {
            if link.link == Link::Connected(conn) {
                link.link = Link::Unresolved;
            }
        }
        self.finger_table.clear_connection(conn);
        self.pointed_table.clear_connection(conn);
        self.peers.retain(|_, c| *c != conn);
        self.network_client.close(conn);
    }

    pub(crate) async fn drop_connection(&mut self, conn: ConnId) {
        let dead = self
            .predecessor
            .as_ref()
            .filter(|p| p.link == Link::Connected(conn))
            .cloned();

        if matches!(&self.join.bootstrap, Some((_, c)) if *c == conn)
            && self.join.awaiting_reply.is_some()
        {
            self.rejection = Some("bootstrap connection closed before the join reply".to_string());
        }

        self.purge_connection(conn);

        if let Some(dead) = dead {
            self.take_over(dead).await;
        }
    }

    /// Starts takeover if the predecessor's connection is gone.
    pub async fn check_predecessor(&mut self) {
        let Some(conn) = self.predecessor.as_ref().and_then(|p| p.link.conn()) else {
            return;
        };
        if !self.network_client.is_open(conn) {
            self.drop_connection(conn).await;
        }
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let summary = |link: &RingLink| PeerSummary {
            node_id: link.node_id,
            address: link.address.clone(),
            connected: link
                .link
                .conn()
                .is_some_and(|c| self.network_client.is_open(c)),
        };
        RingSnapshot {
            node_id: self.info.id,
            address: self.info.address.clone(),
            state: format!("{:?}", self.state),
            predecessor: self.predecessor.as_ref().map(summary),
            successor: self.successor.as_ref().map(summary),
            finger_table: self.finger_table.to_records(),
            pointed_table: self.pointed_table.to_records(),
            local_key_count: self.store.len() as u64,
            pending_messages: self.pending.len() as u64,
            open_connections: u32::try_from(self.network_client.open_connections())
                .unwrap_or(u32::MAX),
            uptime: self.started.elapsed(),
        }
    }
}
