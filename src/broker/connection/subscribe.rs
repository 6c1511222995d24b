//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::{Connection, Role, Subscription};
use crate::broker::Broker;
use crate::delivery::Action;
use crate::hooks::AclAction;
use crate::protocol::{
    Packet, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::topic::parse_filter;

/// Highest QoS the broker grants
const MAX_GRANTED_QOS: QoS = QoS::AtLeastOnce;

impl Connection {
    /// Create the subscription for `raw`, replacing any previous one with the
    /// same raw filter
    ///
    /// Returns whether the filter is new for this connection. Fails once the
    /// connection is disconnected, so nothing is registered after the close
    /// drained the subscription map.
    ///
    /// A new End-Client filter takes its cluster route reference under the
    /// same lock as the map insert; `close` releases exactly the filters it
    /// drains.
    pub(crate) fn register_filter(
        self: &Arc<Self>,
        broker: &Broker,
        raw: &str,
        qos: QoS,
    ) -> Result<bool, &'static str> {
        let kind = parse_filter(raw)?;
        let sub = Arc::new(Subscription::new(
            kind.filter(),
            kind.group(),
            qos,
            Arc::downgrade(self),
        ));

        let mut subs = self.subs.lock();
        if !self.is_connected() {
            return Err("connection closed");
        }
        let previous = subs.remove(raw);
        if let Some(prev) = &previous {
            broker.topics().unsubscribe(prev.filter(), prev);
        }
        broker.topics().subscribe(sub.filter(), qos, sub.clone());
        subs.insert(raw.to_string(), sub);

        let new = previous.is_none();
        if new && self.role == Role::Client {
            broker.cluster().add_routes(&[raw.to_string()]);
        }
        Ok(new)
    }

    /// Drop the subscription for `raw` from the map and the topic tree
    fn unregister_filter(&self, broker: &Broker, raw: &str) -> bool {
        let mut subs = self.subs.lock();
        let Some(sub) = subs.remove(raw) else {
            return false;
        };
        broker.topics().unsubscribe(sub.filter(), &sub);
        if self.role == Role::Client {
            broker.cluster().remove_routes(&[raw.to_string()]);
        }
        true
    }

    /// Re-create the subscriptions of a resumed session
    pub(super) fn restore_session(self: &Arc<Self>, broker: &Arc<Broker>, topics: Vec<(String, QoS)>) {
        if topics.is_empty() {
            return;
        }

        let mut restored = 0;
        for (raw, qos) in topics {
            match self.register_filter(broker, &raw, qos) {
                Ok(_) => restored += 1,
                Err(reason) => {
                    debug!(client_id = %self.client_id, filter = %raw, "session filter not restored: {}", reason);
                }
            }
        }

        debug!(client_id = %self.client_id, count = restored, "session restored");
    }

    pub(super) async fn handle_subscribe(self: &Arc<Self>, broker: &Arc<Broker>, subscribe: Subscribe) {
        match self.role {
            Role::Client => self.client_subscribe(broker, subscribe).await,
            Role::Router | Role::Remote => self.link_subscribe(broker, subscribe).await,
        }
    }

    async fn client_subscribe(self: &Arc<Self>, broker: &Arc<Broker>, subscribe: Subscribe) {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained: Vec<(Publish, QoS)> = Vec::new();

        for req in &subscribe.filters {
            let granted = req.qos.min(MAX_GRANTED_QOS);

            let allowed = broker
                .authorizer()
                .check_acl(
                    AclAction::Sub,
                    &self.client_id,
                    self.username(),
                    self.endpoints.remote.map(|a| a.ip()),
                    &req.filter,
                )
                .await
                .unwrap_or_else(|e| {
                    error!(client_id = %self.client_id, "subscribe ACL check failed: {}", e);
                    false
                });
            if !allowed {
                warn!(client_id = %self.client_id, filter = %req.filter, "subscribe not authorized");
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            broker.emit(self, Action::Subscribe, &req.filter, Bytes::new());

            match self.register_filter(broker, &req.filter, granted) {
                Ok(_) => {
                    broker
                        .sessions()
                        .add_topic(&self.client_id, &req.filter, granted);
                    if let Ok(kind) = parse_filter(&req.filter) {
                        retained.extend(
                            broker
                                .topics()
                                .retained_for(kind.filter())
                                .into_iter()
                                .map(|p| (p, granted)),
                        );
                    }
                    return_codes.push(SubscribeReturnCode::granted(granted));
                }
                Err(reason) => {
                    debug!(client_id = %self.client_id, filter = %req.filter, "subscribe rejected: {}", reason);
                    return_codes.push(SubscribeReturnCode::Failure);
                }
            }
        }

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        };
        if let Err(e) = self.write(&Packet::SubAck(suback)).await {
            error!(client_id = %self.client_id, "SUBACK write failed: {}", e);
            return;
        }

        for (mut publish, granted) in retained {
            publish.qos = publish.qos.min(granted);
            publish.retain = true;
            publish.dup = false;
            publish.packet_id = (publish.qos != QoS::AtMostOnce).then(|| self.next_packet_id());
            self.send(&Packet::Publish(publish)).await;
            broker.metrics().downstream();
        }
    }

    /// SUBSCRIBE forwarded by a peer broker
    ///
    /// Each filter is reference counted; only the first SUBSCRIBE for a raw
    /// filter creates the subscription.
    async fn link_subscribe(self: &Arc<Self>, broker: &Arc<Broker>, subscribe: Subscribe) {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for req in &subscribe.filters {
            let granted = req.qos.min(MAX_GRANTED_QOS);
            if let Err(reason) = parse_filter(&req.filter) {
                debug!(peer = %self.client_id, filter = %req.filter, "route rejected: {}", reason);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let first = {
                let mut refs = self.route_refs.lock();
                let count = refs.entry(req.filter.clone()).or_insert(0);
                *count += 1;
                *count == 1
            };

            if first {
                if let Err(reason) = self.register_filter(broker, &req.filter, granted) {
                    self.route_refs.lock().remove(&req.filter);
                    debug!(peer = %self.client_id, filter = %req.filter, "route rejected: {}", reason);
                    return_codes.push(SubscribeReturnCode::Failure);
                    continue;
                }
            }
            return_codes.push(SubscribeReturnCode::granted(granted));
        }

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        };
        if let Err(e) = self.write(&Packet::SubAck(suback)).await {
            error!(peer = %self.client_id, "SUBACK write failed: {}", e);
        }
    }

    pub(super) async fn handle_unsubscribe(self: &Arc<Self>, broker: &Arc<Broker>, unsubscribe: Unsubscribe) {
        match self.role {
            Role::Client => self.client_unsubscribe(broker, &unsubscribe),
            Role::Router | Role::Remote => self.link_unsubscribe(broker, &unsubscribe),
        }

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
        };
        if let Err(e) = self.write(&Packet::UnsubAck(unsuback)).await {
            error!(client_id = %self.client_id, "UNSUBACK write failed: {}", e);
        }
    }

    fn client_unsubscribe(self: &Arc<Self>, broker: &Arc<Broker>, unsubscribe: &Unsubscribe) {
        for raw in &unsubscribe.filters {
            broker.emit(self, Action::Unsubscribe, raw, Bytes::new());

            if self.unregister_filter(broker, raw) {
                let _ = broker.sessions().remove_topic(&self.client_id, raw);
            }
        }
    }

    fn link_unsubscribe(&self, broker: &Broker, unsubscribe: &Unsubscribe) {
        for raw in &unsubscribe.filters {
            let last = {
                let mut refs = self.route_refs.lock();
                match refs.get_mut(raw) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => {
                        refs.remove(raw);
                        true
                    }
                    None => false,
                }
            };

            if last {
                self.unregister_filter(broker, raw);
            }
        }
    }
}
