//! MQTT Session Registry
//!
//! Per-client record of subscribed (topic, QoS) pairs. A session outlives the
//! connection that created it so operators can inspect it and a reconnecting
//! client can pick it up again. Dropping a session is an external policy
//! decision (clean-session CONNECT, admin removal).

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::QoS;

/// Session lookup error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session exists for the client id
    NotFound(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "session not found: {}", id),
        }
    }
}

impl std::error::Error for SessionError {}

/// In-memory session
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: Arc<str>,
    /// Unix milliseconds at creation
    pub created_at: u64,
    /// Subscribed topics in subscription order; a topic appears once
    topics: Vec<(String, QoS)>,
}

impl Session {
    pub fn new(client_id: Arc<str>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            client_id,
            created_at,
            topics: Vec::new(),
        }
    }

    /// Add a topic, updating its QoS in place if already present
    pub fn add_topic(&mut self, topic: &str, qos: QoS) {
        match self.topics.iter_mut().find(|(t, _)| t == topic) {
            Some(entry) => entry.1 = qos,
            None => self.topics.push((topic.to_string(), qos)),
        }
    }

    /// Remove a topic; returns whether it was present
    pub fn remove_topic(&mut self, topic: &str) -> bool {
        let before = self.topics.len();
        self.topics.retain(|(t, _)| t != topic);
        before != self.topics.len()
    }

    /// Parallel lists of topics and their QoS
    pub fn topics(&self) -> (Vec<String>, Vec<QoS>) {
        self.topics.iter().cloned().unzip()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

/// Session registry shared by all connections of one broker instance
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Look up a session
    pub fn get(&self, client_id: &str) -> Result<Arc<RwLock<Session>>, SessionError> {
        self.sessions
            .get(client_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::NotFound(client_id.to_string()))
    }

    /// Look up a session, creating an empty one if absent
    ///
    /// The boolean is true when the session already existed.
    pub fn get_or_create(&self, client_id: &Arc<str>) -> (Arc<RwLock<Session>>, bool) {
        let mut existed = true;
        let session = self
            .sessions
            .entry(client_id.clone())
            .or_insert_with(|| {
                existed = false;
                Arc::new(RwLock::new(Session::new(client_id.clone())))
            })
            .value()
            .clone();
        (session, existed)
    }

    /// Record a subscribed topic, creating the session on first use
    pub fn add_topic(&self, client_id: &Arc<str>, topic: &str, qos: QoS) {
        let (session, _) = self.get_or_create(client_id);
        session.write().add_topic(topic, qos);
    }

    /// Forget a subscribed topic
    pub fn remove_topic(&self, client_id: &str, topic: &str) -> Result<bool, SessionError> {
        let session = self.get(client_id)?;
        let removed = session.write().remove_topic(topic);
        Ok(removed)
    }

    /// Topics and QoS levels recorded for a client
    pub fn topics(&self, client_id: &str) -> Result<(Vec<String>, Vec<QoS>), SessionError> {
        Ok(self.get(client_id)?.read().topics())
    }

    /// Drop every recorded topic but keep the session
    pub fn clear(&self, client_id: &str) {
        if let Some(session) = self.sessions.get(client_id) {
            session.write().clear();
        }
    }

    /// Destroy a session
    pub fn remove(&self, client_id: &str) -> bool {
        self.sessions.remove(client_id).is_some()
    }

    /// Number of sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
