//! CONNECT handling
//!
//! Runs the handshake on a freshly accepted transport and produces a
//! registered [`Connection`] plus the read half for its read loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionError, Role};
use crate::broker::Broker;
use crate::codec::{Decoder, Encoder};
use crate::config::PeerConfig;
use crate::delivery::Action;
use crate::pool::{Buffer, ObjectPool};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, Publish,
};
use crate::topic::validate_topic_name;
use crate::transport::{self, BoxedReader, BoxedWriter, Endpoints, Transport};

/// Everything fixed at connect time
pub(crate) struct ConnectionInit {
    pub role: Role,
    pub client_id: Arc<str>,
    pub username: Option<String>,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub endpoints: Endpoints,
    pub peer: Option<PeerConfig>,
    pub write_timeout: Option<Duration>,
    pub buffers: Arc<ObjectPool<Buffer>>,
    pub will: Option<Publish>,
}

/// A connection that completed its handshake
pub(crate) struct Accepted {
    pub conn: Arc<Connection>,
    pub reader: BoxedReader,
    /// Bytes read past the CONNECT packet
    pub buf: BytesMut,
}

/// Read the first packet, which must be a CONNECT
async fn read_connect(
    reader: &mut BoxedReader,
    buf: &mut BytesMut,
    decoder: &Decoder,
) -> Result<Connect, ConnectionError> {
    loop {
        if let Some((packet, consumed)) = decoder.decode(&buf[..])? {
            buf.advance(consumed);
            return match packet {
                Packet::Connect(connect) => Ok(*connect),
                _ => Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "first packet must be CONNECT",
                ))),
            };
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before CONNECT",
            )));
        }
    }
}

/// Send a refusing CONNACK on a connection that never got registered
async fn refuse(writer: &mut BoxedWriter, code: ConnectReturnCode) -> ConnectionError {
    let mut buf = BytesMut::with_capacity(4);
    if Encoder::new()
        .encode(&Packet::ConnAck(ConnAck::new(code)), &mut buf)
        .is_ok()
    {
        let _ = writer.write_all(&buf).await;
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
    ConnectionError::Refused(code)
}

fn will_publish(client_id: &str, connect: &Connect) -> Option<Publish> {
    let will = connect.will.as_ref()?;
    if let Err(reason) = validate_topic_name(&will.topic) {
        warn!(client_id, topic = %will.topic, "ignoring will: {}", reason);
        return None;
    }
    Some(Publish {
        qos: will.qos,
        retain: will.retain,
        topic: will.topic.as_str().into(),
        payload: will.payload.clone(),
        ..Default::default()
    })
}

/// Run the CONNECT handshake for an End-Client or an inbound Router link
pub(crate) async fn accept<T: Transport>(
    broker: &Arc<Broker>,
    stream: T,
    endpoints: Endpoints,
    role: Role,
) -> Result<Accepted, ConnectionError> {
    let config = broker.config();
    let (mut reader, mut writer) = transport::split(stream);
    let mut buf = BytesMut::with_capacity(4096);
    let decoder = Decoder::new().with_max_packet_size(config.max_packet_size);

    let connect = match timeout(
        config.connect_timeout,
        read_connect(&mut reader, &mut buf, &decoder),
    )
    .await
    {
        Ok(Ok(connect)) => connect,
        Ok(Err(ConnectionError::Decode(DecodeError::InvalidProtocolVersion(level)))) => {
            debug!(remote = ?endpoints.remote, level, "unsupported protocol level");
            return Err(refuse(&mut writer, ConnectReturnCode::UnacceptableProtocolVersion).await);
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(remote = ?endpoints.remote, "CONNECT timeout");
            return Err(ConnectionError::Timeout);
        }
    };

    // MQTT-3.1.3-8: zero-byte id needs clean session
    if connect.client_id.is_empty() && (!connect.clean_session || role == Role::Router) {
        return Err(refuse(&mut writer, ConnectReturnCode::IdentifierRejected).await);
    }

    let client_id: Arc<str> = if connect.client_id.is_empty() {
        format!("routemq-{:016x}", rand::random::<u64>()).into()
    } else {
        connect.client_id.as_str().into()
    };

    debug!(client_id = %client_id, role = role.as_str(), remote = ?endpoints.remote, "CONNECT");

    let registry = broker.registry_for(role);
    if role == Role::Client {
        let limit = config.max_connections;
        if limit > 0 && !registry.contains(&client_id) && registry.len() >= limit {
            warn!(client_id = %client_id, limit, "connection limit reached");
            return Err(refuse(&mut writer, ConnectReturnCode::ServerUnavailable).await);
        }

        let allowed = broker
            .authorizer()
            .check_connect(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
            .unwrap_or_else(|e| {
                error!(client_id = %client_id, "connect check failed: {}", e);
                false
            });
        if !allowed {
            warn!(client_id = %client_id, "connection not authorized");
            return Err(refuse(&mut writer, ConnectReturnCode::NotAuthorized).await);
        }
    }

    let conn = Connection::new(
        ConnectionInit {
            role,
            client_id: client_id.clone(),
            username: connect.username.clone(),
            keep_alive: connect.keep_alive,
            clean_session: connect.clean_session,
            endpoints,
            peer: None,
            write_timeout: config.write_timeout,
            buffers: broker.buffers(),
            will: will_publish(&client_id, &connect),
        },
        writer,
    );

    if let Some(previous) = registry.store(conn.clone()) {
        info!(client_id = %client_id, "session taken over by new connection");
        previous.close(broker).await;
        // The replaced connection no longer removes its own session
        if role == Role::Client && previous.clean_session() {
            broker.sessions().remove(&client_id);
        }
    }
    broker.metrics().connection_opened(role.as_str());

    let mut restore = Vec::new();
    let mut session_present = false;
    if role == Role::Client {
        let (session, existed) = broker.sessions().get_or_create(&client_id);
        if connect.clean_session {
            session.write().clear();
        } else if existed {
            session_present = true;
            let (topics, qos) = session.read().topics();
            restore = topics.into_iter().zip(qos).collect();
        }
    }

    let connack = ConnAck {
        session_present,
        return_code: ConnectReturnCode::Accepted,
    };
    if let Err(e) = conn.write(&Packet::ConnAck(connack)).await {
        debug!(client_id = %client_id, "CONNACK write failed: {}", e);
        conn.close(broker).await;
        return Err(e);
    }

    match role {
        Role::Client => {
            broker.metrics().client_accepted();
            broker.emit(&conn, Action::Connect, "", bytes::Bytes::new());
            conn.restore_session(broker, restore);
        }
        Role::Router => info!(peer = %client_id, "cluster peer linked"),
        Role::Remote => {}
    }

    Ok(Accepted { conn, reader, buf })
}
