//! PUBLISH handling and fan-out

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use serde_json::json;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use super::{Connection, Role};
use crate::broker::Broker;
use crate::cluster::INFO_TOPIC;
use crate::delivery::Action;
use crate::hooks::AclAction;
use crate::protocol::{Packet, PubAck, Publish, QoS};

/// Topic answered directly by the broker instead of being routed
pub const PING_TOPIC: &str = "ping";

impl Connection {
    pub(super) async fn handle_publish(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        match self.role {
            Role::Client => self.client_publish(broker, publish).await,
            Role::Router | Role::Remote => self.link_publish(broker, publish).await,
        }
    }

    async fn client_publish(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        broker.metrics().upstream();

        let allowed = broker
            .authorizer()
            .check_acl(
                AclAction::Pub,
                &self.client_id,
                self.username(),
                self.endpoints.remote.map(|a| a.ip()),
                &publish.topic,
            )
            .await
            .unwrap_or_else(|e| {
                error!(client_id = %self.client_id, "publish ACL check failed: {}", e);
                false
            });
        if !allowed {
            warn!(client_id = %self.client_id, topic = %publish.topic, "publish not authorized");
            broker.metrics().dropped("acl");
            return;
        }

        if &*publish.topic == INFO_TOPIC {
            warn!(client_id = %self.client_id, "client publish to cluster info topic dropped");
            broker.metrics().dropped("reserved");
            return;
        }

        if &*publish.topic == PING_TOPIC {
            if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                self.send(&Packet::PubAck(PubAck::new(id))).await;
            }
            self.pong(&publish.payload).await;
            return;
        }

        broker.emit(self, Action::Publish, &publish.topic, publish.payload.clone());
        self.acknowledge_and_route(broker, publish).await;
    }

    async fn link_publish(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        if &*publish.topic == INFO_TOPIC {
            if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                self.send(&Packet::PubAck(PubAck::new(id))).await;
            }
            broker
                .cluster()
                .record_peer_info(&self.client_id, &publish.payload);
            return;
        }

        self.acknowledge_and_route(broker, publish).await;
    }

    /// PUBACK a QoS 1 publish, then fan it out; QoS 2 stops here
    async fn acknowledge_and_route(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let Some(id) = publish.packet_id else {
                    return;
                };
                if let Err(e) = self.write(&Packet::PubAck(PubAck::new(id))).await {
                    error!(client_id = %self.client_id, "PUBACK write failed: {}", e);
                    return;
                }
            }
            QoS::ExactlyOnce => {
                debug!(client_id = %self.client_id, topic = %publish.topic, "QoS 2 publish dropped");
                broker.metrics().dropped("qos2");
                return;
            }
        }

        fan_out(broker, &publish, self.role).await;
    }

    /// Answer a publish on the ping topic with the broker clock
    async fn pong(&self, payload: &Bytes) {
        let now_ms = crate::delivery::now_nanos() / 1_000_000;
        let body = json!({
            "pong": String::from_utf8_lossy(payload),
            "ts": now_ms,
        });
        let pong = Publish::new(PING_TOPIC, body.to_string(), QoS::AtMostOnce);
        self.send(&Packet::Publish(pong)).await;
    }
}

/// Deliver `publish` to every matching subscription
///
/// Plain subscriptions each get a copy. All matching shared subscriptions
/// form one pool and a single member, picked uniformly at random, gets the
/// message. Router-owned subscriptions only receive publishes that
/// originated at an End-Client, so a message never bounces between cluster
/// nodes.
pub(crate) async fn fan_out(broker: &Broker, publish: &Publish, origin: Role) {
    if publish.retain {
        broker.topics().retain(publish);
    }

    let matches = broker.topics().subscribers(&publish.topic, publish.qos);
    if matches.is_empty() {
        return;
    }

    let mut shared: SmallVec<[(Arc<Connection>, QoS); 4]> = SmallVec::new();

    for (sub, qos) in &matches {
        let Some(conn) = sub.connection() else {
            continue;
        };
        if conn.role() == Role::Router && origin != Role::Client {
            continue;
        }

        if sub.is_shared() {
            shared.push((conn, *qos));
        } else {
            deliver(broker, &conn, publish, *qos).await;
        }
    }

    if !shared.is_empty() {
        let (conn, qos) = &shared[rand::thread_rng().gen_range(0..shared.len())];
        deliver(broker, conn, publish, *qos).await;
    }
}

async fn deliver(broker: &Broker, conn: &Arc<Connection>, publish: &Publish, qos: QoS) {
    if !conn.is_connected() {
        return;
    }

    let mut out = publish.clone();
    out.qos = qos;
    out.dup = false;
    out.packet_id = (qos != QoS::AtMostOnce).then(|| conn.next_packet_id());
    // Peers keep the flag so they store the retained copy too
    if conn.role() == Role::Client {
        out.retain = false;
    }

    conn.send(&Packet::Publish(out)).await;
    broker.metrics().downstream();
}
