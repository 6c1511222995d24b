//! Management HTTP configuration

use serde::Deserialize;
use std::net::SocketAddr;

/// Admin API and Prometheus scrape endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whether the HTTP endpoint is served
    pub enabled: bool,
    /// HTTP bind address
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:8080".parse().unwrap(),
        }
    }
}
