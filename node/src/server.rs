//! The per-node event loop: accepts ring connections and feeds every
//! connection event to the [`ChordNode`] it owns.

use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chordkv_lib::snapshot::RingSnapshot;

use crate::error::NodeError;
use crate::network_client::{NetworkEvent, RealNetworkClient};
use crate::node::{ChordNode, NodeInfo};
use crate::store::DurableStore;
use crate::Config;

pub struct NodeServer {
    node: ChordNode<RealNetworkClient>,
    listener: TcpListener,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    snapshots: watch::Sender<RingSnapshot>,
}

impl NodeServer {
    /// Binds the ring listener and recovers the node's store.
    ///
    /// The advertised address uses the configured host and the port the
    /// listener actually got, so port 0 works.
    pub async fn bind(config: &Config) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(config.listen_address()).await?;
        let local = listener.local_addr()?;
        let info = NodeInfo {
            id: config.identity(),
            address: format!("{}:{}", config.host, local.port()),
        };

        let store = DurableStore::open(&config.data_dir, info.id, config.log_max_size)?;
        info!(
            "Node {} listening on {} with {} recovered records",
            info.id,
            info.address,
            store.len()
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let node = ChordNode::new(info, store, RealNetworkClient::new(events_tx));
        let (snapshots, _) = watch::channel(node.snapshot());
        Ok(Self {
            node,
            listener,
            events,
            snapshots,
        })
    }

    pub fn address(&self) -> &str {
        &self.node.info.address
    }

    pub async fn join(&mut self, bootstrap: Option<&str>) -> Result<(), NodeError> {
        self.node.join(bootstrap).await
    }

    /// Read-only view of the ring state, refreshed after every event.
    pub fn subscribe(&self) -> watch::Receiver<RingSnapshot> {
        self.snapshots.subscribe()
    }

    /// Runs until the ring rejects this node.
    pub async fn run(mut self) -> Result<(), NodeError> {
        loop {
            self.node.check_predecessor().await;
            self.snapshots.send_replace(self.node.snapshot());
            if let Some(reason) = self.node.join_rejection() {
                return Err(NodeError::JoinRejected(reason.to_string()));
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            error!("Could not disable nagle for {}: {}", peer, e);
                        }
                        let conn = self.node.network_client.register(stream, peer);
                        log_debug!(self.node.info, "Accepted connection {} from {}", conn, peer);
                    }
                    Err(e) => log_error!(self.node.info, "Failed to accept connection: {}", e),
                },
                event = self.events.recv() => match event {
                    Some(event) => self.node.handle_event(event).await,
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Periodically logs the latest snapshot as one JSON line.
pub fn spawn_snapshot_logger(
    snapshots: watch::Receiver<RingSnapshot>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = snapshots.borrow().clone();
            match serde_json::to_string(&snapshot) {
                Ok(line) => info!("Ring snapshot: {}", line),
                Err(e) => error!("Failed to encode ring snapshot: {}", e),
            }
        }
    })
}
