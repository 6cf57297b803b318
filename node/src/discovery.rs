//! Catalog discovery: find a live ring member to bootstrap from and
//! advertise this node with a periodic UDP heartbeat.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;

/// Service type every node registers under.
pub const SERVICE_TYPE: &str = "chordkv";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One catalog registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub project: String,
    /// Host the registration came from.
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub lastheardfrom: f64,
}

impl ServiceDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

/// Parses a `query.json` body, skipping registrations of other shapes.
pub fn parse_services(body: &[u8]) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
    let entries: Vec<Value> = serde_json::from_slice(body)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

/// Picks the most recently heard member of `project`, ignoring `own_name`.
///
/// Registrations are named `"{project}_{instance}"`; only the part before
/// the first `_` is compared.
pub fn select_bootstrap<'a>(
    services: &'a [ServiceDescriptor],
    project: &str,
    own_name: &str,
) -> Option<&'a ServiceDescriptor> {
    services
        .iter()
        .filter(|s| s.kind == SERVICE_TYPE)
        .filter(|s| s.project.split('_').next() == Some(project))
        .filter(|s| s.project != own_name)
        .max_by(|a, b| a.lastheardfrom.total_cmp(&b.lastheardfrom))
}

/// Fetches `{catalog_url}/query.json`.
pub async fn fetch_services(catalog_url: &str) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
    let uri = format!("{}/query.json", catalog_url.trim_end_matches('/'))
        .parse::<Uri>()
        .map_err(|e| DiscoveryError::Http(format!("invalid catalog url: {}", e)))?;

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    debug!("Fetching catalog from {}", uri);
    let res = client
        .get(uri)
        .await
        .map_err(|e| DiscoveryError::Http(e.to_string()))?;
    if !res.status().is_success() {
        return Err(DiscoveryError::Status(res.status().as_u16()));
    }
    let body = res
        .into_body()
        .collect()
        .await
        .map_err(|e| DiscoveryError::Http(e.to_string()))?
        .to_bytes();
    parse_services(&body)
}

/// Address of a live peer of `project` to join through.
pub async fn discover_bootstrap(
    catalog_url: &str,
    project: &str,
    own_name: &str,
) -> Result<String, DiscoveryError> {
    let services = fetch_services(catalog_url).await?;
    select_bootstrap(&services, project, own_name)
        .map(ServiceDescriptor::address)
        .ok_or_else(|| DiscoveryError::NoPeer(project.to_string()))
}

pub fn heartbeat_message(name: &str, port: u16) -> Value {
    json!({
        "type": SERVICE_TYPE,
        "project": name,
        "port": port,
    })
}

/// Registers `name` with the catalog every `interval`, forever.
pub fn spawn_heartbeat(
    catalog_udp: String,
    name: String,
    port: u16,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to open heartbeat socket: {}", e);
                return;
            }
        };
        let payload = heartbeat_message(&name, port).to_string();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match socket.send_to(payload.as_bytes(), catalog_udp.as_str()).await {
                Ok(_) => debug!("Sent heartbeat for {} to {}", name, catalog_udp),
                Err(e) => error!("Failed to send heartbeat to {}: {}", catalog_udp, e),
            }
        }
    })
}
