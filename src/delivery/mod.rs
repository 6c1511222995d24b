//! Side-channel event delivery
//!
//! Every connect, publish, subscribe, unsubscribe and disconnect is reported
//! to an [`EventSink`]. Delivery is fire-and-forget: the broker logs sink
//! errors and carries on, and sinks must never block the caller.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::pool::Reset;

/// What the client did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Connect => "connect",
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
            Action::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// A single side-channel event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub client_id: String,
    pub username: String,
    pub topic: String,
    pub payload: Bytes,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub action: Action,
}

impl Event {
    /// Fill in identity, action and the current time
    pub fn fill(&mut self, client_id: &str, username: Option<&str>, action: Action) {
        self.client_id.push_str(client_id);
        self.username.push_str(username.unwrap_or(""));
        self.action = action;
        self.timestamp = now_nanos();
    }

    /// JSON form handed to external consumers
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "clientid": self.client_id,
            "username": self.username,
            "topic": self.topic,
            "payload": String::from_utf8_lossy(&self.payload),
            "ts": self.timestamp,
            "size": self.payload.len(),
            "action": self.action,
        })
    }
}

impl Reset for Event {
    fn reset(&mut self) {
        self.client_id.clear();
        self.username.clear();
        self.topic.clear();
        self.payload = Bytes::new();
        self.timestamp = 0;
        self.action = Action::default();
    }
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Delivery error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Sink queue is full, the event was dropped
    Full,
    /// Consumer went away
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Full => write!(f, "delivery queue full"),
            DeliveryError::Closed => write!(f, "delivery channel closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Consumer of side-channel events
pub trait EventSink: Send + Sync {
    /// Hand off one event; must return without waiting on the consumer
    fn publish(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &Event) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Writes events to the log at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &Event) -> Result<(), DeliveryError> {
        debug!(
            clientid = %event.client_id,
            action = %event.action,
            topic = %event.topic,
            size = event.payload.len(),
            "event"
        );
        Ok(())
    }
}

/// Forwards events into a bounded channel
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: &Event) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
