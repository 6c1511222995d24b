//! MQTT Broker Core
//!
//! The broker owns every shared table (topic index, sessions, connection
//! registries, cluster routes) and the dispatch pool. Connections hold no
//! reference to it; handlers receive it from the worker that runs them.

mod connection;
mod dispatch;
mod registry;

#[cfg(test)]
mod tests;

pub use connection::{
    Connection, ConnectionError, ConnectionInfo, Role, Status, Subscription, PING_TOPIC,
};
pub(crate) use connection::ConnectionInit;
pub use dispatch::DispatchError;
pub use registry::ClientRegistry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{self, ClusterConfig, ClusterRouter};
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::delivery::{Action, Event, EventSink, NoopSink};
use crate::hooks::{AllowAll, Authorizer};
use crate::metrics::{Metrics, Snapshot};
use crate::pool::{Buffer, ObjectPool};
use crate::protocol::{Publish, QoS};
use crate::session::SessionStore;
use crate::topic::TopicEngine;
use crate::transport::{configure_stream, Endpoints, TransportConfig};

use dispatch::{Dispatcher, Job};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address for End-Clients
    pub bind_addr: SocketAddr,
    /// Number of dispatch workers
    pub workers: usize,
    /// Bounded queue length per worker
    pub queue_capacity: usize,
    /// Maximum End-Client connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Upper bound for a single socket write
    pub write_timeout: Option<Duration>,
    /// Pooled work items and write buffers kept around
    pub pool_capacity: usize,
    pub transport: TransportConfig,
    /// Identity used when dialing peers
    pub node_id: String,
    pub cluster: ClusterConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let cluster = ClusterConfig::default();
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 1024,
            max_connections: 100_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(10),
            write_timeout: None,
            pool_capacity: 1024,
            transport: TransportConfig::default(),
            node_id: cluster.get_node_id(),
            cluster,
        }
    }
}

/// Stored session as shown by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub created_at: u64,
    pub subscriptions: Vec<SessionTopic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionTopic {
    pub filter: String,
    pub qos: u8,
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    topics: TopicEngine<Subscription>,
    sessions: SessionStore,
    /// End-Clients by client id
    clients: ClientRegistry,
    /// Inbound peer links by peer node id
    routers: ClientRegistry,
    dispatcher: Dispatcher,
    cluster: ClusterRouter,
    authorizer: Arc<dyn Authorizer>,
    sink: Arc<dyn EventSink>,
    events: ObjectPool<Event>,
    buffers: Arc<ObjectPool<Buffer>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Create a broker that allows everything and discards events
    ///
    /// Spawns the dispatch workers, so it must be called inside a tokio
    /// runtime.
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Self::with_hooks(config, Arc::new(AllowAll), Arc::new(NoopSink))
    }

    /// Create a broker with custom authorization and event delivery
    pub fn with_hooks(
        config: BrokerConfig,
        authorizer: Arc<dyn Authorizer>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());

        Arc::new_cyclic(|weak| Self {
            dispatcher: Dispatcher::new(
                config.workers,
                config.queue_capacity,
                config.pool_capacity,
                weak.clone(),
            ),
            cluster: ClusterRouter::new(&config.node_id, &config.cluster, metrics.clone()),
            topics: TopicEngine::new(),
            sessions: SessionStore::new(),
            clients: ClientRegistry::new(),
            routers: ClientRegistry::new(),
            authorizer,
            sink,
            events: ObjectPool::with_capacity(config.pool_capacity),
            buffers: Arc::new(ObjectPool::with_capacity(config.pool_capacity)),
            metrics,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicEngine<Subscription> {
        &self.topics
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn cluster(&self) -> &ClusterRouter {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    pub(crate) fn buffers(&self) -> Arc<ObjectPool<Buffer>> {
        self.buffers.clone()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn workers(&self) -> usize {
        self.dispatcher.workers()
    }

    /// The live connection table for a role
    pub fn registry_for(&self, role: Role) -> &ClientRegistry {
        match role {
            Role::Client => &self.clients,
            Role::Router => &self.routers,
            Role::Remote => self.cluster.links(),
        }
    }

    pub(crate) async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        job: Job,
    ) -> Result<(), DispatchError> {
        self.dispatcher.submit(conn, job).await
    }

    /// Hand one side-channel event to the sink; failures are only logged
    pub(crate) fn emit(&self, conn: &Connection, action: Action, topic: &str, payload: Bytes) {
        let mut event = self.events.get();
        event.fill(conn.client_id(), conn.username(), action);
        event.topic.push_str(topic);
        event.payload = payload;

        if let Err(e) = self.sink.publish(&event) {
            warn!(client_id = %conn.client_id(), action = %action, "event delivery failed: {}", e);
            self.metrics.event_error();
        }
        self.events.put(event);
    }

    /// Bind the client listener (and the cluster listener, when enabled),
    /// start the peer links and serve until shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        if self.cluster.is_enabled() {
            let cluster_listener = TcpListener::bind(self.config.cluster.bind).await?;
            info!(
                node_id = %self.cluster.node_id(),
                "cluster listening on {}", self.config.cluster.bind
            );
            tokio::spawn(self.clone().accept_loop(cluster_listener, Role::Router));
            self.connect_peers();
        }

        self.clone().accept_loop(listener, Role::Client).await;
        Ok(())
    }

    /// Start one link task per configured peer
    pub fn connect_peers(self: &Arc<Self>) {
        for peer in &self.config.cluster.peers {
            debug!(peer = %peer.id, addr = %peer.addr, "starting cluster link");
            tokio::spawn(cluster::maintain_link(self.clone(), peer.clone()));
        }
    }

    /// Accept connections of one role until shutdown
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, role: Role) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = listener.accept() => r,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(role = role.as_str(), "New TCP connection from {}", addr);
                    tokio::spawn(self.clone().serve(stream, role));
                }
                Err(e) => error!("Failed to accept TCP connection: {}", e),
            }
        }
        debug!(role = role.as_str(), "accept loop stopped");
    }

    /// Run one accepted socket from handshake to close
    async fn serve(self: Arc<Self>, stream: TcpStream, role: Role) {
        if let Err(e) = configure_stream(&stream, &self.config.transport) {
            debug!("socket options not applied: {}", e);
        }
        let endpoints = Endpoints::of_tcp(&stream);

        match connection::accept(&self, stream, endpoints, role).await {
            Ok(accepted) => {
                accepted
                    .conn
                    .read_loop(self.clone(), accepted.reader, accepted.buf)
                    .await;
            }
            Err(e) => debug!(remote = ?endpoints.remote, "handshake failed: {}", e),
        }
    }

    /// Route a broker-originated message as if a local End-Client sent it
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        let publish = Publish {
            qos: qos.min(QoS::AtLeastOnce),
            retain,
            topic: topic.into(),
            payload,
            ..Default::default()
        };
        connection::fan_out(self, &publish, Role::Client).await;
    }

    /// Live connections of every role, sorted by role then id
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = [Role::Client, Role::Router, Role::Remote]
            .into_iter()
            .flat_map(|role| self.registry_for(role).snapshot())
            .map(|conn| conn.info())
            .collect();
        all.sort_by(|a, b| {
            (a.role.as_str(), &a.client_id).cmp(&(b.role.as_str(), &b.client_id))
        });
        all
    }

    /// Look up a live End-Client
    pub fn connection(&self, client_id: &str) -> Option<ConnectionInfo> {
        self.clients.load(client_id).map(|conn| conn.info())
    }

    /// Close an End-Client connection; false if it is not connected
    pub async fn close_client(self: &Arc<Self>, client_id: &str) -> bool {
        match self.clients.load(client_id) {
            Some(conn) => {
                info!(client_id, "closing connection on request");
                conn.close(self).await;
                true
            }
            None => false,
        }
    }

    pub fn session(&self, client_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.get(client_id).ok()?;
        let session = session.read();
        let (filters, qos) = session.topics();
        Some(SessionInfo {
            client_id: session.client_id.to_string(),
            created_at: session.created_at,
            subscriptions: filters
                .into_iter()
                .zip(qos)
                .map(|(filter, qos)| SessionTopic {
                    filter,
                    qos: qos as u8,
                })
                .collect(),
        })
    }

    /// Copy table sizes into the metric gauges
    pub fn refresh_metrics(&self) {
        self.metrics.refresh(Snapshot {
            sessions: self.sessions.count(),
            subscriptions: self.topics.subscription_count(),
            retained: self.topics.retained_count(),
            cluster_routes: self.cluster.route_count(),
        });
    }

    /// Stop accepting, stop the peer links and close every connection
    pub async fn shutdown(self: &Arc<Self>) {
        info!("broker shutting down");
        self.shutdown.cancel();

        for role in [Role::Client, Role::Router, Role::Remote] {
            for conn in self.registry_for(role).snapshot() {
                // No wills on shutdown
                conn.take_will();
                conn.close(self).await;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
