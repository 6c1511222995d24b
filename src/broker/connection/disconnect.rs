//! Connection teardown and will publishing

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::publish::fan_out;
use super::{Connection, Role};
use crate::broker::Broker;
use crate::delivery::Action;

impl Connection {
    /// Tear the connection down; only the first call does anything
    ///
    /// Flips the status first, so handlers still queued for this connection
    /// become no-ops and no subscription can be registered after the map is
    /// drained below.
    pub async fn close(self: &Arc<Self>, broker: &Arc<Broker>) {
        if !self.mark_disconnected() {
            return;
        }
        self.cancel.cancel();

        broker.emit(self, Action::Disconnect, "", Bytes::new());

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let unlinked = broker.registry_for(self.role).delete(self);
        if unlinked && self.role == Role::Remote {
            broker.metrics().cluster_link_down();
        }

        let drained: Vec<(String, Arc<super::Subscription>)> = self.subs.lock().drain().collect();
        for (_, sub) in &drained {
            broker.topics().unsubscribe(sub.filter(), sub);
        }

        match self.role {
            Role::Client => {
                let filters: Vec<String> = drained.into_iter().map(|(raw, _)| raw).collect();
                broker.cluster().remove_routes(&filters);
                // A successor with the same id owns the session now
                if unlinked && self.clean_session {
                    broker.sessions().remove(&self.client_id);
                }
            }
            Role::Router | Role::Remote => self.route_refs.lock().clear(),
        }

        broker.metrics().connection_closed(self.role.as_str());
        debug!(client_id = %self.client_id, role = self.role.as_str(), "connection closed");

        if let Some(will) = self.take_will() {
            info!(client_id = %self.client_id, topic = %will.topic, "publishing will");
            fan_out(broker, &will, Role::Client).await;
        }
    }
}
