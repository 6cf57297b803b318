use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use chordkv_lib::dht_messages::{Frame, FrameError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::TransportError;

/// Registry handle of one open connection.
pub type ConnId = u64;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection can report back to the node's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Frame { conn: ConnId, frame: Frame },
    /// Well-formed JSON that is not a known message; the connection stays up.
    Invalid { conn: ConnId, reason: String },
    /// Framing broke down; the connection must be torn down.
    Malformed { conn: ConnId, reason: String },
    Closed { conn: ConnId },
}

/// Connection registry used by the node. Inbound frames arrive as
/// [`NetworkEvent`]s on the channel the implementation was built with.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + 'static {
    /// Opens a new connection to `address`.
    async fn connect(&mut self, address: &str) -> Result<ConnId, TransportError>;

    /// Queues a frame on an open connection.
    fn send(&mut self, conn: ConnId, frame: Frame) -> Result<(), TransportError>;

    fn is_open(&self, conn: ConnId) -> bool;

    fn close(&mut self, conn: ConnId);

    fn open_connections(&self) -> usize;
}

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    peer: SocketAddr,
    reader: JoinHandle<()>,
}

/// TCP implementation: one reader and one writer task per connection.
pub struct RealNetworkClient {
    events: mpsc::UnboundedSender<NetworkEvent>,
    connections: HashMap<ConnId, Connection>,
    next_id: ConnId,
}

impl RealNetworkClient {
    pub fn new(events: mpsc::UnboundedSender<NetworkEvent>) -> Self {
        Self {
            events,
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Adopts an accepted or freshly connected stream.
    pub fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> ConnId {
        let conn = self.next_id;
        self.next_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(conn, write_half, outbound_rx));
        let reader = tokio::spawn(read_loop(conn, read_half, self.events.clone()));

        debug!("Registered connection {} with {}", conn, peer);
        self.connections.insert(
            conn,
            Connection {
                outbound,
                peer,
                reader,
            },
        );
        conn
    }
}

#[async_trait]
impl NetworkClient for RealNetworkClient {
    async fn connect(&mut self, address: &str) -> Result<ConnId, TransportError> {
        debug!(
            "Attempting to connect to {} with timeout {:?}",
            address, CONNECT_TIMEOUT
        );
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", address, e);
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!(
                    "Connection to {} timed out after {:?}",
                    address, CONNECT_TIMEOUT
                );
                return Err(TransportError::Timeout(address.to_string()));
            }
        };
        let peer = stream.peer_addr().map_err(|e| TransportError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable nagle on {}: {}", address, e);
        }
        Ok(self.register(stream, peer))
    }

    fn send(&mut self, conn: ConnId, frame: Frame) -> Result<(), TransportError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        let line = frame.encode()?;
        connection
            .outbound
            .send(line)
            .map_err(|_| TransportError::Closed(conn))
    }

    fn is_open(&self, conn: ConnId) -> bool {
        self.connections
            .get(&conn)
            .is_some_and(|c| !c.outbound.is_closed() && !c.reader.is_finished())
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            // Dropping the sender ends the writer, which shuts the socket down.
            connection.reader.abort();
            debug!("Closed connection {} with {}", conn, connection.peer);
        }
    }

    fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

async fn read_loop(
    conn: ConnId,
    read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<NetworkEvent>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error on connection {}: {}", conn, e);
                break;
            }
        }

        match Frame::decode(&line) {
            Ok(frame) => {
                if events.send(NetworkEvent::Frame { conn, frame }).is_err() {
                    return;
                }
            }
            Err(FrameError::Invalid(reason)) => {
                if events.send(NetworkEvent::Invalid { conn, reason }).is_err() {
                    return;
                }
            }
            Err(FrameError::Malformed(reason)) => {
                warn!("Malformed frame on connection {}: {}", conn, reason);
                let _ = events.send(NetworkEvent::Malformed { conn, reason });
                return;
            }
        }
    }
    let _ = events.send(NetworkEvent::Closed { conn });
}

async fn write_loop(
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = outbound.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            error!("Failed to write to connection {}: {}", conn, e);
            return;
        }
    }
    if let Err(e) = write_half.shutdown().await {
        debug!("Shutdown error on connection {} (non-critical): {}", conn, e);
    }
}
