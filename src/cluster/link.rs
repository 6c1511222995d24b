//! Outbound peer links
//!
//! One task per configured peer keeps a [`Role::Remote`] link alive: dial,
//! handshake as the local node, announce ourselves, replay the live routes,
//! then run the normal read loop until the link dies and start over.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ClusterError, PeerConfig, INFO_TOPIC};
use crate::broker::{Broker, Connection, ConnectionInit, Role};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS};
use crate::transport::{self, configure_stream, BoxedReader, BoxedWriter, Endpoints};

/// Keep a link to `peer` up until the broker shuts down
pub(crate) async fn maintain_link(broker: Arc<Broker>, peer: PeerConfig) {
    let shutdown = broker.shutdown_token();
    let retry = broker.config().cluster.reconnect_interval;

    loop {
        let attempt = async {
            match dial(&broker, &peer).await {
                Ok(conn) => {
                    conn.cancelled().await;
                    info!(peer = %peer.id, "cluster link lost");
                }
                Err(e) => warn!(peer = %peer.id, addr = %peer.addr, "cluster link failed: {}", e),
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = attempt => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(retry) => {}
        }
    }
}

async fn write_raw(writer: &mut BoxedWriter, packet: &Packet) -> Result<(), ClusterError> {
    let mut buf = BytesMut::with_capacity(64);
    Encoder::new()
        .encode(packet, &mut buf)
        .map_err(|e| ClusterError::Connection(e.into()))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_connack(
    reader: &mut BoxedReader,
    buf: &mut BytesMut,
    decoder: &Decoder,
) -> Result<ConnAck, ClusterError> {
    loop {
        let decoded = decoder
            .decode(&buf[..])
            .map_err(|e| ClusterError::Connection(e.into()))?;
        if let Some((packet, consumed)) = decoded {
            buf.advance(consumed);
            return match packet {
                Packet::ConnAck(connack) => Ok(connack),
                other => Err(ClusterError::UnexpectedPacket(other.packet_type())),
            };
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before CONNACK",
            )));
        }
    }
}

/// Dial `peer` and bring the link fully up
async fn dial(broker: &Arc<Broker>, peer: &PeerConfig) -> Result<Arc<Connection>, ClusterError> {
    let config = broker.config();
    let cluster = broker.cluster();

    let stream = timeout(config.connect_timeout, TcpStream::connect(&peer.addr))
        .await
        .map_err(|_| ClusterError::Timeout)??;
    if let Err(e) = configure_stream(&stream, &config.transport) {
        debug!(peer = %peer.id, "socket options not applied: {}", e);
    }
    let endpoints = Endpoints::of_tcp(&stream);
    let (mut reader, mut writer) = transport::split(stream);

    let connect = Connect {
        client_id: cluster.node_id().to_string(),
        clean_session: true,
        keep_alive: config.cluster.keep_alive,
        ..Default::default()
    };
    write_raw(&mut writer, &Packet::Connect(Box::new(connect))).await?;

    let mut buf = BytesMut::with_capacity(4096);
    let decoder = Decoder::new().with_max_packet_size(config.max_packet_size);
    let connack = timeout(
        config.connect_timeout,
        read_connack(&mut reader, &mut buf, &decoder),
    )
    .await
    .map_err(|_| ClusterError::Timeout)??;
    if connack.return_code != ConnectReturnCode::Accepted {
        return Err(ClusterError::Refused(connack.return_code));
    }

    let conn = Connection::new(
        ConnectionInit {
            role: Role::Remote,
            client_id: peer.id.as_str().into(),
            username: None,
            keep_alive: config.cluster.keep_alive,
            clean_session: true,
            endpoints,
            peer: Some(peer.clone()),
            write_timeout: config.write_timeout,
            buffers: broker.buffers(),
            will: None,
        },
        writer,
    );
    broker.metrics().connection_opened(Role::Remote.as_str());
    info!(peer = %peer.id, addr = %peer.addr, "cluster link up");

    let announce = match serde_json::to_vec(cluster.node_info()) {
        Ok(body) => Publish::new(INFO_TOPIC, body, QoS::AtMostOnce),
        Err(e) => {
            conn.close(broker).await;
            return Err(ClusterError::Io(e.into()));
        }
    };
    if let Err(e) = conn.write(&Packet::Publish(announce)).await {
        conn.close(broker).await;
        return Err(e.into());
    }

    cluster.resync(conn.clone());

    tokio::spawn(conn.clone().read_loop(broker.clone(), reader, buf));
    if config.cluster.keep_alive > 0 {
        let period = Duration::from_secs(config.cluster.keep_alive as u64);
        tokio::spawn(ping_link(conn.clone(), period));
    }

    Ok(conn)
}

async fn ping_link(conn: Arc<Connection>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = conn.cancelled() => return,
            _ = ticker.tick() => conn.send(&Packet::PingReq).await,
        }
    }
}
