//! Broker core tests over in-memory transports

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use super::*;
use crate::codec::{Decoder, Encoder};
use crate::delivery::ChannelSink;
use crate::hooks::{AclAction, HookResult};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, SubscribeFilter,
    SubscribeReturnCode, Unsubscribe,
};

fn test_config() -> BrokerConfig {
    BrokerConfig {
        workers: 2,
        queue_capacity: 16,
        pool_capacity: 16,
        node_id: "test-node".to_string(),
        ..Default::default()
    }
}

/// Client side of an in-memory connection
struct Peer {
    stream: DuplexStream,
    buf: BytesMut,
}

impl Peer {
    async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        Encoder::new().encode(&packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(2)).await
    }

    async fn recv_within(&mut self, limit: Duration) -> Option<Packet> {
        let decoder = Decoder::new();
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Ok(Some((packet, consumed))) = decoder.decode(&self.buf) {
                self.buf.advance(consumed);
                return Some(packet);
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(left, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    /// True once the broker side has shut the stream
    async fn closed(&mut self) -> bool {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(Duration::from_secs(2), self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Run the accept path on one end of a duplex pipe and return the other end
async fn attach(broker: &Arc<Broker>, role: Role, connect: Connect) -> (Peer, ConnAck) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let broker_task = broker.clone();
    tokio::spawn(async move {
        if let Ok(accepted) =
            connection::accept(&broker_task, server, Endpoints::default(), role).await
        {
            accepted
                .conn
                .read_loop(broker_task.clone(), accepted.reader, accepted.buf)
                .await;
        }
    });

    let mut peer = Peer {
        stream: client,
        buf: BytesMut::new(),
    };
    peer.send(Packet::Connect(Box::new(connect))).await;
    match peer.recv().await {
        Some(Packet::ConnAck(ack)) => (peer, ack),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

fn connect(client_id: &str) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        keep_alive: 0,
        ..Default::default()
    }
}

async fn client(broker: &Arc<Broker>, client_id: &str) -> Peer {
    let (peer, ack) = attach(broker, Role::Client, connect(client_id)).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    peer
}

async fn subscribe(peer: &mut Peer, filter: &str, qos: QoS) -> Vec<SubscribeReturnCode> {
    peer.send(Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter::new(filter, qos)],
    }))
    .await;
    match peer.recv().await {
        Some(Packet::SubAck(ack)) => ack.return_codes,
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_registry_delete_checks_identity() {
    let broker = Broker::new(test_config());
    let _first = client(&broker, "dup").await;
    let first = broker.clients.load("dup").unwrap();

    let _second = client(&broker, "dup").await;
    let second = broker.clients.load("dup").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    // The replaced connection cannot evict its successor
    assert!(!broker.clients.delete(&first));
    assert!(broker.clients.contains("dup"));
    assert!(broker.clients.delete(&second));
    assert!(broker.clients.is_empty());
}

#[tokio::test]
async fn test_takeover_closes_previous_connection() {
    let broker = Broker::new(test_config());
    let mut first = client(&broker, "same").await;
    let old = broker.clients.load("same").unwrap();

    let mut second = client(&broker, "same").await;
    assert!(first.closed().await);
    assert_eq!(old.status(), Status::Disconnected);

    second.send(Packet::PingReq).await;
    assert_eq!(second.recv().await, Some(Packet::PingResp));
    assert_eq!(broker.clients.len(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = Broker::new(test_config());
    let _peer = client(&broker, "twice").await;
    let conn = broker.clients.load("twice").unwrap();
    assert_eq!(broker.metrics().connection_count.get(), 1);

    conn.close(&broker).await;
    conn.close(&broker).await;

    assert_eq!(conn.status(), Status::Disconnected);
    assert_eq!(broker.metrics().connection_count.get(), 0);
    assert!(broker.clients.is_empty());
}

#[tokio::test]
async fn test_register_after_close_fails() {
    let broker = Broker::new(test_config());
    let _peer = client(&broker, "late").await;
    let conn = broker.clients.load("late").unwrap();

    assert_eq!(conn.register_filter(&broker, "a/b", QoS::AtMostOnce), Ok(true));
    assert_eq!(conn.register_filter(&broker, "a/b", QoS::AtLeastOnce), Ok(false));
    assert_eq!(broker.topics().subscription_count(), 1);

    conn.close(&broker).await;
    assert_eq!(broker.topics().subscription_count(), 0);
    assert!(conn.register_filter(&broker, "a/c", QoS::AtMostOnce).is_err());
    assert_eq!(broker.topics().subscription_count(), 0);
}

#[tokio::test]
async fn test_packets_from_one_client_stay_in_order() {
    let broker = Broker::new(test_config());
    let mut sub = client(&broker, "sub").await;
    subscribe(&mut sub, "seq", QoS::AtMostOnce).await;

    let mut publisher = client(&broker, "pub").await;
    for i in 0..50u32 {
        publisher
            .send(Packet::Publish(Publish::new(
                "seq",
                i.to_string(),
                QoS::AtMostOnce,
            )))
            .await;
    }

    for i in 0..50u32 {
        match sub.recv().await {
            Some(Packet::Publish(p)) => assert_eq!(p.payload, i.to_string()),
            other => panic!("expected publish {}, got {:?}", i, other),
        }
    }
}

/// Panics on publish ACL checks for one topic
struct PanicOn(&'static str);

#[async_trait]
impl Authorizer for PanicOn {
    async fn check_acl(
        &self,
        _action: AclAction,
        _client_id: &str,
        _username: Option<&str>,
        _source_ip: Option<IpAddr>,
        topic: &str,
    ) -> HookResult<bool> {
        if topic == self.0 {
            panic!("boom");
        }
        Ok(true)
    }
}

#[tokio::test]
async fn test_handler_panic_closes_only_that_connection() {
    let broker = Broker::with_hooks(
        BrokerConfig {
            workers: 1,
            ..test_config()
        },
        Arc::new(PanicOn("explode")),
        Arc::new(crate::delivery::NoopSink),
    );

    let mut victim = client(&broker, "victim").await;
    let mut bystander = client(&broker, "bystander").await;

    victim
        .send(Packet::Publish(Publish::new("explode", "x", QoS::AtMostOnce)))
        .await;
    assert!(victim.closed().await);

    // The single worker survived the panic
    bystander.send(Packet::PingReq).await;
    assert_eq!(bystander.recv().await, Some(Packet::PingResp));
    assert!(!broker.clients.contains("victim"));
}

#[tokio::test]
async fn test_router_link_refcounts_filters() {
    let broker = Broker::new(test_config());
    let (mut link, ack) = attach(&broker, Role::Router, connect("peer-1")).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    for _ in 0..2 {
        assert_eq!(
            subscribe(&mut link, "x/#", QoS::AtLeastOnce).await,
            vec![SubscribeReturnCode::GrantedQoS1]
        );
    }
    assert_eq!(broker.topics().subscription_count(), 1);

    let unsubscribe = |id| {
        Packet::Unsubscribe(Unsubscribe {
            packet_id: id,
            filters: vec!["x/#".to_string()],
        })
    };

    link.send(unsubscribe(2)).await;
    assert!(matches!(link.recv().await, Some(Packet::UnsubAck(_))));
    assert_eq!(broker.topics().subscription_count(), 1);

    link.send(unsubscribe(3)).await;
    assert!(matches!(link.recv().await, Some(Packet::UnsubAck(_))));
    assert_eq!(broker.topics().subscription_count(), 0);
}

#[tokio::test]
async fn test_router_gets_client_publishes_only() {
    let broker = Broker::new(test_config());
    let (mut link, _) = attach(&broker, Role::Router, connect("peer-1")).await;
    subscribe(&mut link, "t", QoS::AtMostOnce).await;

    // A publish arriving from a peer is not sent back to router links
    let (mut other_link, _) = attach(&broker, Role::Router, connect("peer-2")).await;
    other_link
        .send(Packet::Publish(Publish::new("t", "from-peer", QoS::AtMostOnce)))
        .await;
    assert_eq!(link.recv_within(Duration::from_millis(200)).await, None);

    let mut local = client(&broker, "local").await;
    let mut retained = Publish::new("t", "from-client", QoS::AtMostOnce);
    retained.retain = true;
    local.send(Packet::Publish(retained)).await;

    match link.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.payload, "from-client");
            assert!(p.retain, "router links keep the retain flag");
        }
        other => panic!("expected publish, got {:?}", other),
    }
}

#[tokio::test]
async fn test_router_link_rejects_empty_id() {
    let broker = Broker::new(test_config());
    let (_link, ack) = attach(&broker, Role::Router, connect("")).await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);
}

#[tokio::test]
async fn test_events_reach_sink() {
    let (sink, mut events) = ChannelSink::new(16);
    let broker = Broker::with_hooks(test_config(), Arc::new(AllowAll), Arc::new(sink));

    let mut peer = client(&broker, "ev").await;
    subscribe(&mut peer, "e/1", QoS::AtMostOnce).await;
    peer.send(Packet::Publish(Publish::new("e/1", "hi", QoS::AtMostOnce)))
        .await;
    assert!(matches!(peer.recv().await, Some(Packet::Publish(_))));
    peer.send(Packet::Disconnect).await;

    let mut actions = Vec::new();
    while actions.len() < 4 {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.client_id, "ev");
        actions.push(event.action);
    }
    assert_eq!(
        actions,
        vec![
            Action::Connect,
            Action::Subscribe,
            Action::Publish,
            Action::Disconnect
        ]
    );
}

#[tokio::test]
async fn test_client_subscriptions_feed_cluster_routes() {
    let broker = Broker::new(BrokerConfig {
        cluster: ClusterConfig {
            enabled: true,
            ..Default::default()
        },
        ..test_config()
    });

    let mut a = client(&broker, "a").await;
    let mut b = client(&broker, "b").await;
    subscribe(&mut a, "r/+", QoS::AtMostOnce).await;
    subscribe(&mut b, "r/+", QoS::AtMostOnce).await;
    wait_until(|| broker.cluster().route_refs("r/+") == 2).await;

    a.send(Packet::Disconnect).await;
    wait_until(|| broker.cluster().route_refs("r/+") == 1).await;

    b.send(Packet::Unsubscribe(Unsubscribe {
        packet_id: 9,
        filters: vec!["r/+".to_string()],
    }))
    .await;
    assert!(matches!(b.recv().await, Some(Packet::UnsubAck(_))));
    assert_eq!(broker.cluster().route_refs("r/+"), 0);
    assert_eq!(broker.cluster().route_count(), 0);
}

#[tokio::test]
async fn test_admin_views() {
    let broker = Broker::new(test_config());
    let (mut peer, _) = attach(
        &broker,
        Role::Client,
        Connect {
            clean_session: false,
            ..connect("view")
        },
    )
    .await;
    subscribe(&mut peer, "v/#", QoS::AtLeastOnce).await;

    let info = broker.connection("view").unwrap();
    assert_eq!(info.role, Role::Client);
    assert_eq!(info.subscriptions, vec!["v/#".to_string()]);

    let session = broker.session("view").unwrap();
    assert_eq!(session.subscriptions.len(), 1);
    assert_eq!(session.subscriptions[0].qos, 1);

    assert!(broker.close_client("view").await);
    assert!(peer.closed().await);
    assert!(!broker.close_client("view").await);
    assert!(broker.connection("view").is_none());
    // Persistent sessions outlive connections
    assert!(broker.session("view").is_some());
}

#[tokio::test]
async fn test_dispatch_counts() {
    let broker = Broker::new(test_config());
    assert_eq!(broker.workers(), 2);

    let seen = Arc::new(AtomicUsize::new(0));
    let mut peers = Vec::new();
    for i in 0..8 {
        peers.push(client(&broker, &format!("c{}", i)).await);
    }
    for peer in &mut peers {
        peer.send(Packet::PingReq).await;
    }
    for peer in &mut peers {
        if peer.recv().await == Some(Packet::PingResp) {
            seen.fetch_add(1, Ordering::Relaxed);
        }
    }
    assert_eq!(seen.load(Ordering::Relaxed), 8);
    assert_eq!(broker.metrics().client_total.get(), 8);
}

fn clustered() -> BrokerConfig {
    BrokerConfig {
        cluster: ClusterConfig {
            enabled: true,
            ..Default::default()
        },
        ..test_config()
    }
}

/// Holds up subscribe ACL checks for one filter
struct SlowFilter(&'static str, Duration);

#[async_trait]
impl Authorizer for SlowFilter {
    async fn check_acl(
        &self,
        action: AclAction,
        _client_id: &str,
        _username: Option<&str>,
        _source_ip: Option<IpAddr>,
        topic: &str,
    ) -> HookResult<bool> {
        if action == AclAction::Sub && topic == self.0 {
            tokio::time::sleep(self.1).await;
        }
        Ok(true)
    }
}

#[tokio::test]
async fn test_takeover_mid_subscribe_releases_routes() {
    let broker = Broker::with_hooks(
        clustered(),
        Arc::new(SlowFilter("slow/b", Duration::from_millis(300))),
        Arc::new(crate::delivery::NoopSink),
    );

    let mut first = client(&broker, "racer").await;
    first
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![
                SubscribeFilter::new("fast/a", QoS::AtMostOnce),
                SubscribeFilter::new("slow/b", QoS::AtMostOnce),
            ],
        }))
        .await;
    wait_until(|| broker.cluster().route_refs("fast/a") == 1).await;

    // Takeover while the first SUBSCRIBE is still waiting on its ACL check
    let _second = client(&broker, "racer").await;
    assert!(first.closed().await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(broker.topics().subscription_count(), 0);
    assert_eq!(broker.cluster().route_refs("fast/a"), 0);
    assert_eq!(broker.cluster().route_refs("slow/b"), 0);
    assert_eq!(broker.cluster().route_count(), 0);
}

#[tokio::test]
async fn test_resubscribe_replaces_subscription() {
    let broker = Broker::new(clustered());
    let mut sub = client(&broker, "again").await;
    subscribe(&mut sub, "a/b", QoS::AtMostOnce).await;
    subscribe(&mut sub, "a/b", QoS::AtLeastOnce).await;

    assert_eq!(broker.topics().subscription_count(), 1);
    assert_eq!(broker.cluster().route_refs("a/b"), 1);
    assert_eq!(
        broker.connection("again").unwrap().subscriptions,
        vec!["a/b".to_string()]
    );

    let mut publisher = client(&broker, "again-pub").await;
    let mut publish = Publish::new("a/b", "once", QoS::AtLeastOnce);
    publish.packet_id = Some(5);
    publisher.send(Packet::Publish(publish)).await;

    match sub.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.payload, "once");
            assert_eq!(p.qos, QoS::AtLeastOnce);
        }
        other => panic!("expected publish, got {:?}", other),
    }
    assert_eq!(sub.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_clean_session_removed_on_close() {
    let broker = Broker::new(test_config());

    let mut transient = client(&broker, "transient").await;
    subscribe(&mut transient, "t/#", QoS::AtMostOnce).await;
    assert!(broker.session("transient").is_some());
    transient.send(Packet::Disconnect).await;
    assert!(transient.closed().await);
    wait_until(|| broker.session("transient").is_none()).await;

    let (mut durable, _) = attach(
        &broker,
        Role::Client,
        Connect {
            clean_session: false,
            ..connect("durable")
        },
    )
    .await;
    subscribe(&mut durable, "d/#", QoS::AtMostOnce).await;
    durable.send(Packet::Disconnect).await;
    assert!(durable.closed().await);
    assert!(broker.session("durable").is_some());
    assert_eq!(broker.sessions().count(), 1);
}

#[tokio::test]
async fn test_takeover_of_clean_session_starts_fresh() {
    let broker = Broker::new(test_config());
    let mut first = client(&broker, "swap").await;
    subscribe(&mut first, "s/1", QoS::AtMostOnce).await;

    let (_second, ack) = attach(
        &broker,
        Role::Client,
        Connect {
            clean_session: false,
            ..connect("swap")
        },
    )
    .await;
    assert!(first.closed().await);
    assert!(!ack.session_present);
    assert!(broker.session("swap").unwrap().subscriptions.is_empty());
    assert_eq!(broker.sessions().count(), 1);
}

#[tokio::test]
async fn test_link_close_emits_disconnect_event() {
    let (sink, mut events) = ChannelSink::new(16);
    let broker = Broker::with_hooks(test_config(), Arc::new(AllowAll), Arc::new(sink));

    let (mut link, _) = attach(&broker, Role::Router, connect("peer-9")).await;
    link.send(Packet::Disconnect).await;
    assert!(link.closed().await);

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.client_id, "peer-9");
    assert_eq!(event.action, Action::Disconnect);
}
