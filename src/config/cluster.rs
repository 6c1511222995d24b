//! Cluster Configuration
//!
//! Static peer list for broker-to-broker routing. Every node dials every
//! configured peer and accepts peer links on its own cluster listener.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (taken from the hostname if not set)
    pub node_id: Option<String>,

    /// Address peer brokers connect to
    /// Default: 0.0.0.0:1993
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Peers this node dials
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Delay between reconnect attempts to a lost peer
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Keep alive (seconds) sent in the link CONNECT; also the PINGREQ period
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
}

/// A remote broker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    /// Identity of the peer, used for logging and link bookkeeping
    pub id: String,
    /// `host:port` of the peer's cluster listener
    pub addr: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1993".parse().unwrap()
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_keep_alive() -> u16 {
    30
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            bind: default_bind(),
            peers: Vec::new(),
            reconnect_interval: default_reconnect_interval(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, falling back to the hostname
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{:08x}", rand::random::<u32>()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert!(config.node_id.is_none());
        assert_eq!(config.bind, "0.0.0.0:1993".parse().unwrap());
        assert!(config.peers.is_empty());
        assert_eq!(config.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.keep_alive, 30);
    }

    #[test]
    fn test_get_node_id_with_explicit() {
        let mut config = ClusterConfig::default();
        config.node_id = Some("my-node".to_string());
        assert_eq!(config.get_node_id(), "my-node");
    }

    #[test]
    fn test_get_node_id_auto_generated() {
        let config = ClusterConfig::default();
        assert!(!config.get_node_id().is_empty());
    }
}
