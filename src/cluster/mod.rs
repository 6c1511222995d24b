//! Cluster routing
//!
//! Brokers form a full mesh of MQTT links. Every node dials each configured
//! peer (a [`Role::Remote`] link) and accepts the peers' links on its cluster
//! listener (as [`Role::Router`] connections).
//!
//! Subscriptions travel over the Remote links: the first local End-Client
//! subscribing to a raw filter causes a SUBSCRIBE to every peer, the last one
//! leaving causes an UNSUBSCRIBE. Each peer then holds a Router-owned
//! subscription for the filter and forwards matching End-Client publishes to
//! us. Publishes arriving from a peer are never forwarded again.
//!
//! # Usage
//!
//! ```toml
//! # routemq.toml
//! [cluster]
//! enabled = true
//! node_id = "node-a"
//! bind = "0.0.0.0:1993"
//! peers = [{ id = "node-b", addr = "10.0.0.2:1993" }]
//! ```

mod link;

pub(crate) use link::maintain_link;

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{ClientRegistry, Connection, ConnectionError};
use crate::metrics::Metrics;
use crate::protocol::{ConnectReturnCode, Packet, QoS, Subscribe, SubscribeFilter, Unsubscribe};

// Re-export cluster config
pub use crate::config::{ClusterConfig, PeerConfig};

/// Reserved topic carrying node information between peers
pub const INFO_TOPIC: &str = "broker000100101info";

/// Cluster error types
#[derive(Debug)]
pub enum ClusterError {
    Io(io::Error),
    Connection(ConnectionError),
    /// The peer answered CONNECT with a refusal
    Refused(ConnectReturnCode),
    /// The peer sent something other than CONNACK first
    UnexpectedPacket(u8),
    Timeout,
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Io(e) => write!(f, "IO error: {}", e),
            ClusterError::Connection(e) => write!(f, "Link error: {}", e),
            ClusterError::Refused(code) => write!(f, "Link refused: {:?}", code),
            ClusterError::UnexpectedPacket(t) => write!(f, "Unexpected packet type {}", t),
            ClusterError::Timeout => write!(f, "Link handshake timeout"),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        ClusterError::Io(e)
    }
}

impl From<ConnectionError> for ClusterError {
    fn from(e: ConnectionError) -> Self {
        ClusterError::Connection(e)
    }
}

/// What a node announces about itself on [`INFO_TOPIC`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub version: String,
    /// Address of the node's cluster listener
    pub cluster_bind: String,
    /// Milliseconds since the Unix epoch
    pub started_at: u64,
}

impl NodeInfo {
    pub fn new(node_id: &str, config: &ClusterConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            cluster_bind: config.bind.to_string(),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

/// Route changes, applied in order by the update task
#[derive(Debug)]
enum RouteUpdate {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// A freshly dialed link: send it every live route, then start updating it
    Resync {
        link: Arc<Connection>,
        filters: Vec<String>,
    },
}

/// Local route reference counts plus the set of outbound peer links
pub struct ClusterRouter {
    enabled: bool,
    node_info: NodeInfo,
    /// Raw filter -> number of local End-Client subscriptions
    refs: Mutex<AHashMap<String, u64>>,
    links: Arc<ClientRegistry>,
    peer_info: DashMap<String, serde_json::Value>,
    updates: mpsc::UnboundedSender<RouteUpdate>,
}

impl ClusterRouter {
    /// Create the router and spawn its update task
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(node_id: &str, config: &ClusterConfig, metrics: Arc<Metrics>) -> Self {
        let links = Arc::new(ClientRegistry::new());
        let (updates, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_updates(rx, links.clone(), metrics));

        Self {
            enabled: config.enabled,
            node_info: NodeInfo::new(node_id, config),
            refs: Mutex::new(AHashMap::new()),
            links,
            peer_info: DashMap::new(),
            updates,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn node_id(&self) -> &str {
        &self.node_info.node_id
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// Outbound peer links, keyed by peer id
    pub fn links(&self) -> &ClientRegistry {
        &self.links
    }

    /// Count one more local subscriber for each raw filter
    ///
    /// Filters going from zero to one are sent to every peer.
    pub fn add_routes(&self, filters: &[String]) {
        if !self.enabled || filters.is_empty() {
            return;
        }

        let mut refs = self.refs.lock();
        let fresh: Vec<String> = filters
            .iter()
            .filter(|raw| {
                let count = refs.entry((*raw).clone()).or_insert(0);
                *count += 1;
                *count == 1
            })
            .cloned()
            .collect();

        if !fresh.is_empty() {
            debug!(filters = ?fresh, "cluster routes added");
            // Sent under the lock so the queue sees transitions in order
            let _ = self.updates.send(RouteUpdate::Subscribe(fresh));
        }
    }

    /// Count one subscriber less for each raw filter
    ///
    /// Filters going from one to zero are withdrawn from every peer.
    pub fn remove_routes(&self, filters: &[String]) {
        if !self.enabled || filters.is_empty() {
            return;
        }

        let mut refs = self.refs.lock();
        let mut gone = Vec::new();
        for raw in filters {
            match refs.get_mut(raw) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    refs.remove(raw);
                    gone.push(raw.clone());
                }
                None => warn!(filter = %raw, "cluster route released more often than added"),
            }
        }

        if !gone.is_empty() {
            debug!(filters = ?gone, "cluster routes removed");
            let _ = self.updates.send(RouteUpdate::Unsubscribe(gone));
        }
    }

    /// Hand a newly dialed link to the update task
    ///
    /// The task sends it the current routes before any later change, then
    /// adds it to the link set.
    pub(crate) fn resync(&self, link: Arc<Connection>) {
        let refs = self.refs.lock();
        let mut filters: Vec<String> = refs.keys().cloned().collect();
        filters.sort();
        let _ = self.updates.send(RouteUpdate::Resync { link, filters });
    }

    /// Current reference count for a raw filter
    pub fn route_refs(&self, raw: &str) -> u64 {
        self.refs.lock().get(raw).copied().unwrap_or(0)
    }

    pub fn route_count(&self) -> usize {
        self.refs.lock().len()
    }

    /// Store the info a peer published on [`INFO_TOPIC`]
    pub(crate) fn record_peer_info(&self, peer: &str, payload: &Bytes) {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(info) => {
                debug!(peer, "peer info updated");
                self.peer_info.insert(peer.to_string(), info);
            }
            Err(e) => warn!(peer, "invalid peer info: {}", e),
        }
    }

    /// Info last announced by each peer
    pub fn peer_info(&self) -> Vec<(String, serde_json::Value)> {
        let mut all: Vec<_> = self
            .peer_info
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

fn subscribe_packet(link: &Connection, filters: &[String]) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id: link.next_packet_id(),
        filters: filters
            .iter()
            .map(|f| SubscribeFilter::new(f.as_str(), QoS::AtLeastOnce))
            .collect(),
    })
}

fn unsubscribe_packet(link: &Connection, filters: &[String]) -> Packet {
    Packet::Unsubscribe(Unsubscribe {
        packet_id: link.next_packet_id(),
        filters: filters.to_vec(),
    })
}

async fn apply_updates(
    mut rx: mpsc::UnboundedReceiver<RouteUpdate>,
    links: Arc<ClientRegistry>,
    metrics: Arc<Metrics>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            RouteUpdate::Subscribe(filters) => {
                for link in links.snapshot() {
                    link.send(&subscribe_packet(&link, &filters)).await;
                }
            }
            RouteUpdate::Unsubscribe(filters) => {
                for link in links.snapshot() {
                    link.send(&unsubscribe_packet(&link, &filters)).await;
                }
            }
            RouteUpdate::Resync { link, filters } => {
                if !filters.is_empty() {
                    link.send(&subscribe_packet(&link, &filters)).await;
                }
                if links.store(link.clone()).is_none() {
                    metrics.cluster_link_up();
                }
                // Closed while we were sending; its close may have run first
                if !link.is_connected() && links.delete(&link) {
                    metrics.cluster_link_down();
                }
            }
        }
    }
    debug!("cluster update task stopped");
}
