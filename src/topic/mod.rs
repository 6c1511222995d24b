//! Topic matching and subscription management
//!
//! [`TopicEngine`] is the broker's topic index: a concurrent trie of
//! subscription filters plus the retained-message store. It knows nothing
//! about connections; subscription records are opaque `Arc<S>` handles
//! compared by identity.

mod tree;
pub mod validation;

#[cfg(test)]
mod tests;

pub use tree::TopicTree;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;

use crate::protocol::{Publish, QoS};

/// Prefix marking a shared subscription filter
pub const SHARE_PREFIX: &str = "$share/";

fn share_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$share/([0-9a-zA-Z_-]+)/(.*)$").expect("static shared subscription regex")
    })
}

/// A subscription filter after shared-group parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind<'a> {
    /// Regular filter, every matching subscription receives the message
    Plain(&'a str),
    /// `$share/<group>/<filter>`, one group member receives each message
    Shared { group: &'a str, filter: &'a str },
}

impl<'a> FilterKind<'a> {
    /// The filter stored in the trie
    pub fn filter(&self) -> &'a str {
        match self {
            FilterKind::Plain(f) => f,
            FilterKind::Shared { filter, .. } => filter,
        }
    }

    pub fn group(&self) -> Option<&'a str> {
        match self {
            FilterKind::Plain(_) => None,
            FilterKind::Shared { group, .. } => Some(group),
        }
    }
}

/// Parse and validate a raw subscription filter
///
/// Anything starting with `$share/` must be a well-formed shared filter with
/// a `[0-9a-zA-Z_-]+` group and a non-empty residual filter.
pub fn parse_filter(raw: &str) -> Result<FilterKind<'_>, &'static str> {
    let kind = if raw.starts_with(SHARE_PREFIX) {
        let caps = share_pattern()
            .captures(raw)
            .ok_or("malformed shared subscription")?;
        match (caps.get(1), caps.get(2)) {
            (Some(group), Some(filter)) if !filter.as_str().is_empty() => FilterKind::Shared {
                group: group.as_str(),
                filter: filter.as_str(),
            },
            _ => return Err("malformed shared subscription"),
        }
    } else {
        FilterKind::Plain(raw)
    };

    validate_topic_filter(kind.filter())?;
    Ok(kind)
}

/// Subscription trie plus retained messages
pub struct TopicEngine<S> {
    tree: TopicTree<S>,
    retained: DashMap<Arc<str>, Publish>,
}

impl<S> TopicEngine<S> {
    pub fn new() -> Self {
        Self {
            tree: TopicTree::new(),
            retained: DashMap::new(),
        }
    }

    /// Register a subscription record under `filter`
    pub fn subscribe(&self, filter: &str, qos: QoS, subscription: Arc<S>) {
        self.tree.insert(filter, qos, subscription);
    }

    /// Remove a subscription record; returns false if it was not registered
    pub fn unsubscribe(&self, filter: &str, subscription: &Arc<S>) -> bool {
        self.tree.remove(filter, subscription)
    }

    /// All subscriptions matching `topic`, each with `min(sub QoS, qos)`
    pub fn subscribers(&self, topic: &str, qos: QoS) -> Vec<(Arc<S>, QoS)> {
        self.tree.matches(topic, qos)
    }

    /// Store (or clear, on empty payload) the retained message for a topic
    pub fn retain(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.retained.remove(&publish.topic);
            return;
        }

        let mut stored = publish.clone();
        stored.retain = true;
        stored.dup = false;
        stored.packet_id = None;
        self.retained.insert(publish.topic.clone(), stored);
    }

    /// Retained messages whose topic matches `filter`
    pub fn retained_for(&self, filter: &str) -> Vec<Publish> {
        self.retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.tree.len()
    }
}

impl<S> Default for TopicEngine<S> {
    fn default() -> Self {
        Self::new()
    }
}
