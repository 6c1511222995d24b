//! Prometheus metrics for routemq
//!
//! Upstream/downstream message counters plus point-in-time gauges for
//! sessions, connections, subscriptions and cluster links. Each broker owns
//! its own [`Registry`], so several brokers can live in one process.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use prometheus::{Encoder, TextEncoder};

/// Point-in-time counts read from the broker's tables at scrape time
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub sessions: usize,
    pub subscriptions: usize,
    pub retained: usize,
    pub cluster_routes: usize,
}

/// All routemq metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub client_total: IntCounter,
    pub connection_count: IntGauge,
    pub connections_by_role: IntGaugeVec,

    // Message metrics
    pub message_upstream_total: IntCounter,
    pub message_downstream_total: IntCounter,
    pub message_dropped_total: IntCounterVec,

    // Table sizes
    pub session_count: IntGauge,
    pub subscription_count: IntGauge,
    pub retained_count: IntGauge,

    // Cluster metrics
    pub cluster_links_current: IntGauge,
    pub cluster_routes_current: IntGauge,

    // Side channel
    pub event_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let client_total = IntCounter::with_opts(Opts::new(
            "routemq_client_total",
            "Total number of accepted client connections since startup",
        ))
        .unwrap();

        let connection_count = IntGauge::with_opts(Opts::new(
            "routemq_connection_count",
            "Current number of live connections",
        ))
        .unwrap();

        let connections_by_role = IntGaugeVec::new(
            Opts::new(
                "routemq_connections_by_role",
                "Current connections by role (client, router, remote)",
            ),
            &["role"],
        )
        .unwrap();

        let message_upstream_total = IntCounter::with_opts(Opts::new(
            "routemq_message_upstream_total",
            "PUBLISH packets received from clients",
        ))
        .unwrap();

        let message_downstream_total = IntCounter::with_opts(Opts::new(
            "routemq_message_downstream_total",
            "PUBLISH packets delivered to subscribers",
        ))
        .unwrap();

        let message_dropped_total = IntCounterVec::new(
            Opts::new(
                "routemq_message_dropped_total",
                "PUBLISH packets dropped without fan-out",
            ),
            &["reason"],
        )
        .unwrap();

        let session_count = IntGauge::with_opts(Opts::new(
            "routemq_session_count",
            "Sessions currently tracked",
        ))
        .unwrap();

        let subscription_count = IntGauge::with_opts(Opts::new(
            "routemq_subscription_count",
            "Subscriptions currently registered in the topic tree",
        ))
        .unwrap();

        let retained_count = IntGauge::with_opts(Opts::new(
            "routemq_retained_count",
            "Retained messages currently stored",
        ))
        .unwrap();

        let cluster_links_current = IntGauge::with_opts(Opts::new(
            "routemq_cluster_links_current",
            "Outbound cluster links currently connected",
        ))
        .unwrap();

        let cluster_routes_current = IntGauge::with_opts(Opts::new(
            "routemq_cluster_routes_current",
            "Filters currently routed to cluster peers",
        ))
        .unwrap();

        let event_errors_total = IntCounter::with_opts(Opts::new(
            "routemq_event_errors_total",
            "Side-channel events the sink refused",
        ))
        .unwrap();

        registry
            .register(Box::new(client_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_count.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_by_role.clone()))
            .unwrap();
        registry
            .register(Box::new(message_upstream_total.clone()))
            .unwrap();
        registry
            .register(Box::new(message_downstream_total.clone()))
            .unwrap();
        registry
            .register(Box::new(message_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(session_count.clone()))
            .unwrap();
        registry
            .register(Box::new(subscription_count.clone()))
            .unwrap();
        registry
            .register(Box::new(retained_count.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_links_current.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_routes_current.clone()))
            .unwrap();
        registry
            .register(Box::new(event_errors_total.clone()))
            .unwrap();

        Self {
            registry,
            client_total,
            connection_count,
            connections_by_role,
            message_upstream_total,
            message_downstream_total,
            message_dropped_total,
            session_count,
            subscription_count,
            retained_count,
            cluster_links_current,
            cluster_routes_current,
            event_errors_total,
        }
    }

    // Helper methods for common operations

    pub fn connection_opened(&self, role: &str) {
        self.connection_count.inc();
        self.connections_by_role.with_label_values(&[role]).inc();
    }

    pub fn connection_closed(&self, role: &str) {
        self.connection_count.dec();
        self.connections_by_role.with_label_values(&[role]).dec();
    }

    pub fn client_accepted(&self) {
        self.client_total.inc();
    }

    pub fn upstream(&self) {
        self.message_upstream_total.inc();
    }

    pub fn downstream(&self) {
        self.message_downstream_total.inc();
    }

    pub fn dropped(&self, reason: &str) {
        self.message_dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn event_error(&self) {
        self.event_errors_total.inc();
    }

    pub fn cluster_link_up(&self) {
        self.cluster_links_current.inc();
    }

    pub fn cluster_link_down(&self) {
        self.cluster_links_current.dec();
    }

    /// Copy table sizes into the gauges
    pub fn refresh(&self, snapshot: Snapshot) {
        self.session_count.set(snapshot.sessions as i64);
        self.subscription_count.set(snapshot.subscriptions as i64);
        self.retained_count.set(snapshot.retained as i64);
        self.cluster_routes_current.set(snapshot.cluster_routes as i64);
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
