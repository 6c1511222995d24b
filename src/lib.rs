//! RouteMQ - clustered MQTT v3.1.1 broker engine
//!
//! Accepts End-Client connections, routes publishes to matching
//! subscriptions (including `$share/<group>/` shared groups), keeps retained
//! messages and in-memory sessions, and forwards traffic between a mesh of
//! peer brokers over plain MQTT links.

pub mod acl;
pub mod admin;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod hooks;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::AclProvider;
pub use admin::AdminServer;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig, Role};
pub use cluster::{ClusterConfig, ClusterRouter};
pub use config::Config;
pub use delivery::{Action, Event, EventSink};
pub use hooks::{AllowAll, Authorizer, CompositeAuthorizer};
pub use metrics::Metrics;
pub use protocol::QoS;
