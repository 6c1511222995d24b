//! Connection state machine
//!
//! One [`Connection`] per live transport. The read task decodes packets and
//! hands them to the dispatch pool; workers run the handlers in `publish`,
//! `subscribe` and `disconnect`, writing replies through the connection's
//! write lock.
//!
//! Status only ever moves from connected to disconnected. Once it has, every
//! handler and every write for the connection becomes a no-op.

mod connect;
mod disconnect;
mod publish;
mod subscribe;

pub(crate) use connect::{accept, ConnectionInit};
pub(crate) use publish::fan_out;
pub use publish::PING_TOPIC;

use std::io;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::dispatch::Job;
use super::Broker;
use crate::codec::{Decoder, Encoder};
use crate::config::PeerConfig;
use crate::pool::{Buffer, ObjectPool};
use crate::protocol::{
    ConnectReturnCode, DecodeError, EncodeError, Packet, ProtocolError, Publish, QoS,
};
use crate::transport::{BoxedReader, BoxedWriter, Endpoints};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Encode(EncodeError),
    /// CONNACK carried a non-zero return code
    Refused(ConnectReturnCode),
    Timeout,
    /// The connection is already disconnected
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {:?}", code),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Who is on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// An end user
    Client,
    /// A peer broker that dialed our cluster listener
    Router,
    /// A link we dialed to a peer broker
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Router => "router",
            Role::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connected,
    Disconnected,
}

const CONNECTED: u8 = 1;
const DISCONNECTED: u8 = 2;

/// One filter registered by one connection
///
/// Owned by the connection's subscription map; the topic tree only holds
/// further `Arc` handles that it compares by identity.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    group: Option<String>,
    qos: QoS,
    conn: Weak<Connection>,
}

impl Subscription {
    pub(crate) fn new(
        filter: &str,
        group: Option<&str>,
        qos: QoS,
        conn: Weak<Connection>,
    ) -> Self {
        Self {
            filter: filter.to_string(),
            group: group.map(str::to_string),
            qos,
            conn,
        }
    }

    /// Filter as stored in the topic tree (share prefix stripped)
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn is_shared(&self) -> bool {
        self.group.is_some()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }
}

/// Serializable view of a connection for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub role: Role,
    pub status: Status,
    pub keep_alive: u16,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    /// Milliseconds since the Unix epoch
    pub connected_at: u64,
    pub subscriptions: Vec<String>,
}

pub struct Connection {
    role: Role,
    client_id: Arc<str>,
    username: Option<String>,
    keep_alive: u16,
    /// End-Client asked for a clean session at CONNECT
    clean_session: bool,
    endpoints: Endpoints,
    connected_at: SystemTime,
    peer: Option<PeerConfig>,
    status: AtomicU8,
    cancel: CancellationToken,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    write_timeout: Option<Duration>,
    buffers: Arc<ObjectPool<Buffer>>,
    will: Mutex<Option<Publish>>,
    /// Raw filter text -> subscription
    subs: Mutex<AHashMap<String, Arc<Subscription>>>,
    /// Per-filter SUBSCRIBE count on Router links
    route_refs: Mutex<AHashMap<String, u64>>,
    next_packet_id: AtomicU16,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(init: ConnectionInit, writer: BoxedWriter) -> Arc<Self> {
        Arc::new(Self {
            role: init.role,
            client_id: init.client_id,
            username: init.username,
            keep_alive: init.keep_alive,
            clean_session: init.clean_session,
            endpoints: init.endpoints,
            connected_at: SystemTime::now(),
            peer: init.peer,
            status: AtomicU8::new(CONNECTED),
            cancel: CancellationToken::new(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            write_timeout: init.write_timeout,
            buffers: init.buffers,
            will: Mutex::new(init.will),
            subs: Mutex::new(AHashMap::new()),
            route_refs: Mutex::new(AHashMap::new()),
            next_packet_id: AtomicU16::new(1),
        })
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// The peer this link was dialed to (Remote links only)
    pub fn peer(&self) -> Option<&PeerConfig> {
        self.peer.as_ref()
    }

    pub fn status(&self) -> Status {
        match self.status.load(Ordering::Acquire) {
            CONNECTED => Status::Connected,
            _ => Status::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Flip the status to disconnected; true only for the call that did it
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.status
            .compare_exchange(CONNECTED, DISCONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Token cancelled when the connection closes
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Raw filters currently subscribed, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.subs.lock().keys().cloned().collect();
        filters.sort();
        filters
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id.to_string(),
            username: self.username.clone(),
            role: self.role,
            status: self.status(),
            keep_alive: self.keep_alive,
            local_addr: self.endpoints.local.map(|a| a.to_string()),
            remote_addr: self.endpoints.remote.map(|a| a.to_string()),
            connected_at: self
                .connected_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            subscriptions: self.subscriptions(),
        }
    }

    /// Read deadline: one and a half keep alive periods, none for keep alive 0
    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_millis(self.keep_alive as u64 * 1500))
    }

    /// Next outbound packet identifier, never zero
    pub(crate) fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Drop the will so a clean DISCONNECT does not publish it
    pub(crate) fn take_will(&self) -> Option<Publish> {
        self.will.lock().take()
    }

    /// Encode and write one packet under the write lock
    ///
    /// A no-op once the connection is disconnected.
    pub async fn write(&self, packet: &Packet) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Ok(());
        }

        let mut buf = self.buffers.get();
        Encoder::new().encode(packet, &mut buf.0)?;

        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                None => Ok(()),
                Some(writer) => {
                    let io = async {
                        writer.write_all(&buf.0).await?;
                        writer.flush().await
                    };
                    match self.write_timeout {
                        Some(limit) => match timeout(limit, io).await {
                            Ok(r) => r.map_err(ConnectionError::from),
                            Err(_) => Err(ConnectionError::Timeout),
                        },
                        None => io.await.map_err(ConnectionError::from),
                    }
                }
            }
        };

        self.buffers.put(buf);
        result
    }

    /// Write a packet, logging and dropping it on failure
    pub(crate) async fn send(&self, packet: &Packet) {
        if let Err(e) = self.write(packet).await {
            error!(
                client_id = %self.client_id,
                packet_type = packet.packet_type(),
                "write failed: {}",
                e
            );
        }
    }

    /// Decode packets and feed them to the dispatch pool until the transport
    /// fails or the connection is cancelled
    ///
    /// `buf` carries any bytes read past the CONNECT packet.
    pub(crate) async fn read_loop(
        self: Arc<Self>,
        broker: Arc<Broker>,
        mut reader: BoxedReader,
        mut buf: BytesMut,
    ) {
        let decoder = Decoder::new().with_max_packet_size(broker.config().max_packet_size);
        let deadline = self.read_timeout();

        loop {
            loop {
                match decoder.decode(&buf) {
                    Ok(Some((packet, consumed))) => {
                        buf.advance(consumed);
                        if matches!(packet, Packet::Connect(_)) {
                            debug!(client_id = %self.client_id, "second CONNECT");
                            self.submit_lost(&broker).await;
                            return;
                        }
                        if broker.dispatch(&self, Job::Packet(packet)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client_id = %self.client_id, "decode error: {}", e);
                        self.submit_lost(&broker).await;
                        return;
                    }
                }
            }

            let read = read_with_deadline(deadline, reader.read_buf(&mut buf));
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = read => r,
            };

            match result {
                Ok(0) => {
                    debug!(client_id = %self.client_id, "connection closed by peer");
                    self.submit_lost(&broker).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(client_id = %self.client_id, "read error: {}", e);
                    self.submit_lost(&broker).await;
                    return;
                }
            }
        }
    }

    async fn submit_lost(self: &Arc<Self>, broker: &Arc<Broker>) {
        if broker.dispatch(self, Job::Lost).await.is_err() {
            // No worker left to run the close
            self.close(broker).await;
        }
    }
}

async fn read_with_deadline<F>(deadline: Option<Duration>, read: F) -> io::Result<usize>
where
    F: std::future::Future<Output = io::Result<usize>>,
{
    match deadline {
        Some(limit) => timeout(limit, read).await.unwrap_or_else(|_| {
            Err(io::Error::new(io::ErrorKind::TimedOut, "keep alive expired"))
        }),
        None => read.await,
    }
}

/// Run one unit of work for `conn`; called by the dispatch workers
pub(crate) async fn handle(broker: &Arc<Broker>, conn: &Arc<Connection>, job: Job) {
    let packet = match job {
        Job::Lost => return conn.close(broker).await,
        Job::Packet(packet) => packet,
    };

    if !conn.is_connected() {
        return;
    }

    match packet {
        Packet::Publish(publish) => conn.handle_publish(broker, publish).await,
        Packet::Subscribe(subscribe) => conn.handle_subscribe(broker, subscribe).await,
        Packet::Unsubscribe(unsubscribe) => conn.handle_unsubscribe(broker, unsubscribe).await,
        Packet::PingReq => conn.send(&Packet::PingResp).await,
        Packet::Disconnect => {
            conn.take_will();
            conn.close(broker).await;
        }
        Packet::Connect(_) => conn.close(broker).await,
        other => {
            trace!(
                client_id = %conn.client_id,
                packet_type = other.packet_type(),
                "ignored packet"
            );
        }
    }
}
