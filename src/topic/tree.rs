//! Concurrent topic tree
//!
//! A trie keyed by topic level where every node carries its own lock, so
//! subscribe/unsubscribe only contend with operations on the same filter
//! path and lookups never block each other.
//!
//! Lock discipline:
//! - readers and subscribers hold at most one node lock at a time
//! - pruning locks parent then child, always top-down
//! - a pruned node is flagged `detached`; an insert that lands on a detached
//!   node restarts from the root

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

const MULTI_WILDCARD: &str = "#";
const SINGLE_WILDCARD: &str = "+";

struct Node<S> {
    inner: RwLock<NodeInner<S>>,
}

struct NodeInner<S> {
    children: AHashMap<CompactString, Arc<Node<S>>>,
    subscribers: SmallVec<[(Arc<S>, QoS); 2]>,
    detached: bool,
}

impl<S> Node<S> {
    fn new() -> Self {
        Self {
            inner: RwLock::new(NodeInner {
                children: AHashMap::new(),
                subscribers: SmallVec::new(),
                detached: false,
            }),
        }
    }
}

/// Topic trie holding non-owning handles to subscription records
///
/// `S` is whatever the caller uses as a subscription record; the tree only
/// compares records by pointer identity.
pub struct TopicTree<S> {
    root: Arc<Node<S>>,
    count: AtomicUsize,
}

impl<S> TopicTree<S> {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Register `subscriber` under `filter`
    ///
    /// Inserting the same record twice under one filter updates its QoS.
    pub fn insert(&self, filter: &str, qos: QoS, subscriber: Arc<S>) {
        'retry: loop {
            let mut node = self.root.clone();
            for level in filter.split('/') {
                node = match child_or_insert(&node, level) {
                    Some(child) => child,
                    None => continue 'retry,
                };
            }

            let mut inner = node.inner.write();
            if inner.detached {
                continue 'retry;
            }
            match inner
                .subscribers
                .iter_mut()
                .find(|(existing, _)| Arc::ptr_eq(existing, &subscriber))
            {
                Some(entry) => entry.1 = qos,
                None => {
                    inner.subscribers.push((subscriber, qos));
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }
    }

    /// Remove `subscriber` from `filter`, pruning nodes left empty
    ///
    /// Returns true if the record was registered under that filter.
    pub fn remove(&self, filter: &str, subscriber: &Arc<S>) -> bool {
        let mut path: SmallVec<[(Arc<Node<S>>, &str); 8]> = SmallVec::new();
        let mut node = self.root.clone();
        for level in filter.split('/') {
            let child = node.inner.read().children.get(level).cloned();
            match child {
                Some(child) => {
                    path.push((node, level));
                    node = child;
                }
                None => return false,
            }
        }

        let removed = {
            let mut inner = node.inner.write();
            let before = inner.subscribers.len();
            inner
                .subscribers
                .retain(|(existing, _)| !Arc::ptr_eq(existing, subscriber));
            before != inner.subscribers.len()
        };
        if !removed {
            return false;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);

        // Walk back up, unlinking empty nodes
        let mut child = node;
        while let Some((parent, level)) = path.pop() {
            let mut parent_inner = parent.inner.write();
            let mut child_inner = child.inner.write();
            if child_inner.detached
                || !child_inner.subscribers.is_empty()
                || !child_inner.children.is_empty()
            {
                break;
            }
            let linked = parent_inner
                .children
                .get(level)
                .is_some_and(|current| Arc::ptr_eq(current, &child));
            if !linked {
                break;
            }
            child_inner.detached = true;
            parent_inner.children.remove(level);
            drop(child_inner);
            drop(parent_inner);
            child = parent;
        }

        true
    }

    /// Collect every record whose filter matches `topic`, with the QoS capped
    /// at `qos`
    pub fn matches(&self, topic: &str, qos: QoS) -> Vec<(Arc<S>, QoS)> {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut out = Vec::new();
        collect(&self.root, &levels, qos, &mut out);
        out
    }

    /// Number of (filter, record) registrations
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Default for TopicTree<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the child for `level`, creating it if needed; None if `node` was
/// pruned concurrently
fn child_or_insert<S>(node: &Arc<Node<S>>, level: &str) -> Option<Arc<Node<S>>> {
    if let Some(child) = node.inner.read().children.get(level) {
        return Some(child.clone());
    }

    let mut inner = node.inner.write();
    if inner.detached {
        return None;
    }
    Some(
        inner
            .children
            .entry(CompactString::new(level))
            .or_insert_with(|| Arc::new(Node::new()))
            .clone(),
    )
}

fn collect<S>(node: &Arc<Node<S>>, levels: &[&str], qos: QoS, out: &mut Vec<(Arc<S>, QoS)>) {
    let (multi, exact, single) = {
        let inner = node.inner.read();
        if levels.is_empty() {
            push_capped(&inner.subscribers, qos, out);
        }
        (
            inner.children.get(MULTI_WILDCARD).cloned(),
            levels.first().and_then(|l| inner.children.get(*l).cloned()),
            levels
                .first()
                .and_then(|_| inner.children.get(SINGLE_WILDCARD).cloned()),
        )
    };

    // '#' covers this level and everything below, including nothing
    if let Some(multi) = multi {
        push_capped(&multi.inner.read().subscribers, qos, out);
    }

    if let Some((_, rest)) = levels.split_first() {
        if let Some(exact) = exact {
            collect(&exact, rest, qos, out);
        }
        if let Some(single) = single {
            collect(&single, rest, qos, out);
        }
    }
}

#[inline]
fn push_capped<S>(subscribers: &[(Arc<S>, QoS)], qos: QoS, out: &mut Vec<(Arc<S>, QoS)>) {
    out.extend(
        subscribers
            .iter()
            .map(|(sub, sub_qos)| (sub.clone(), qos.min(*sub_qos))),
    );
}
