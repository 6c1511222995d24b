//! Topic engine tests

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;

#[derive(Debug)]
struct Sub(&'static str);

fn names(matches: &[(Arc<Sub>, QoS)]) -> Vec<&'static str> {
    let mut names: Vec<_> = matches.iter().map(|(s, _)| s.0).collect();
    names.sort_unstable();
    names
}

#[test]
fn test_subscribers_wildcards() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.subscribe("a/+/c", QoS::AtLeastOnce, Arc::new(Sub("plus")));
    engine.subscribe("a/#", QoS::AtLeastOnce, Arc::new(Sub("hash")));
    engine.subscribe("a/b/c", QoS::AtLeastOnce, Arc::new(Sub("exact")));
    engine.subscribe("a/+", QoS::AtLeastOnce, Arc::new(Sub("one-level")));
    engine.subscribe("#", QoS::AtLeastOnce, Arc::new(Sub("all")));

    assert_eq!(
        names(&engine.subscribers("a/b/c", QoS::AtLeastOnce)),
        vec!["all", "exact", "hash", "plus"]
    );
    assert_eq!(
        names(&engine.subscribers("a", QoS::AtLeastOnce)),
        vec!["all", "hash"]
    );
    assert_eq!(
        names(&engine.subscribers("a/x", QoS::AtLeastOnce)),
        vec!["all", "hash", "one-level"]
    );
    assert_eq!(names(&engine.subscribers("b", QoS::AtLeastOnce)), vec!["all"]);
}

#[test]
fn test_no_subscribers_is_empty() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.subscribe("x/y", QoS::AtMostOnce, Arc::new(Sub("s")));
    assert!(engine.subscribers("x/z", QoS::AtMostOnce).is_empty());
}

#[test]
fn test_effective_qos_is_minimum() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.subscribe("t", QoS::AtLeastOnce, Arc::new(Sub("q1")));
    engine.subscribe("t", QoS::AtMostOnce, Arc::new(Sub("q0")));

    let mut found: Vec<_> = engine
        .subscribers("t", QoS::ExactlyOnce)
        .into_iter()
        .map(|(s, q)| (s.0, q))
        .collect();
    found.sort_by_key(|(name, _)| *name);
    assert_eq!(
        found,
        vec![("q0", QoS::AtMostOnce), ("q1", QoS::AtLeastOnce)]
    );

    let capped = engine.subscribers("t", QoS::AtMostOnce);
    assert!(capped.iter().all(|(_, q)| *q == QoS::AtMostOnce));
}

#[test]
fn test_same_record_twice_updates_qos() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    let sub = Arc::new(Sub("s"));
    engine.subscribe("a/b", QoS::AtMostOnce, sub.clone());
    engine.subscribe("a/b", QoS::AtLeastOnce, sub.clone());

    let found = engine.subscribers("a/b", QoS::AtLeastOnce);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].1, QoS::AtLeastOnce);
    assert_eq!(engine.subscription_count(), 1);
}

#[test]
fn test_unsubscribe_by_identity() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    let first = Arc::new(Sub("first"));
    let second = Arc::new(Sub("second"));
    engine.subscribe("a/b", QoS::AtMostOnce, first.clone());
    engine.subscribe("a/b", QoS::AtMostOnce, second.clone());

    assert!(engine.unsubscribe("a/b", &first));
    assert!(!engine.unsubscribe("a/b", &first));
    assert_eq!(
        names(&engine.subscribers("a/b", QoS::AtMostOnce)),
        vec!["second"]
    );
    assert!(!engine.unsubscribe("a/c", &second));
    assert!(!engine.unsubscribe("a/b/c", &second));
}

#[test]
fn test_prune_then_resubscribe() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    let deep = Arc::new(Sub("deep"));
    let shallow = Arc::new(Sub("shallow"));
    engine.subscribe("a/b/c/d", QoS::AtMostOnce, deep.clone());
    engine.subscribe("a/b", QoS::AtMostOnce, shallow.clone());

    assert!(engine.unsubscribe("a/b/c/d", &deep));
    assert_eq!(
        names(&engine.subscribers("a/b", QoS::AtMostOnce)),
        vec!["shallow"]
    );
    assert!(engine.subscribers("a/b/c/d", QoS::AtMostOnce).is_empty());

    engine.subscribe("a/b/c/d", QoS::AtMostOnce, deep.clone());
    assert_eq!(
        names(&engine.subscribers("a/b/c/d", QoS::AtMostOnce)),
        vec!["deep"]
    );
    assert_eq!(engine.subscription_count(), 2);
}

#[test]
fn test_concurrent_subscribe_unsubscribe_same_path() {
    let engine: Arc<TopicEngine<Sub>> = Arc::new(TopicEngine::new());
    let keeper = Arc::new(Sub("keeper"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            let keeper = keeper.clone();
            std::thread::spawn(move || {
                let churn = Arc::new(Sub("churn"));
                for _ in 0..500 {
                    engine.subscribe("x/y/z", QoS::AtMostOnce, churn.clone());
                    assert!(engine.unsubscribe("x/y/z", &churn));
                }
                if i == 0 {
                    engine.subscribe("x/y/z", QoS::AtLeastOnce, keeper);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let found = engine.subscribers("x/y/z", QoS::AtLeastOnce);
    assert_eq!(names(&found), vec!["keeper"]);
    assert_eq!(engine.subscription_count(), 1);
}

// ============================================================================
// Retained messages
// ============================================================================

fn retained(topic: &str, payload: &'static [u8]) -> Publish {
    Publish {
        retain: true,
        ..Publish::new(topic, Bytes::from_static(payload), QoS::AtLeastOnce)
    }
}

#[test]
fn test_retain_overwrites() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.retain(&retained("home/temp", b"20"));
    engine.retain(&retained("home/temp", b"21"));

    let found = engine.retained_for("home/temp");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].payload, Bytes::from_static(b"21"));
    assert!(found[0].retain);
    assert_eq!(engine.retained_count(), 1);
}

#[test]
fn test_retain_empty_payload_clears() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.retain(&retained("home/temp", b"20"));
    engine.retain(&retained("home/temp", b""));
    assert_eq!(engine.retained_count(), 0);
    assert!(engine.retained_for("#").is_empty());
}

#[test]
fn test_retained_for_wildcards() {
    let engine: TopicEngine<Sub> = TopicEngine::new();
    engine.retain(&retained("home/kitchen/temp", b"1"));
    engine.retain(&retained("home/garage/temp", b"2"));
    engine.retain(&retained("office/temp", b"3"));

    let mut topics: Vec<_> = engine
        .retained_for("home/+/temp")
        .into_iter()
        .map(|p| p.topic.to_string())
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["home/garage/temp", "home/kitchen/temp"]);
    assert_eq!(engine.retained_for("#").len(), 3);
}

// ============================================================================
// Filter parsing
// ============================================================================

#[test]
fn test_parse_filter_shared() {
    assert_eq!(
        parse_filter("$share/workers/jobs/+"),
        Ok(FilterKind::Shared {
            group: "workers",
            filter: "jobs/+"
        })
    );
    assert_eq!(parse_filter("jobs/#"), Ok(FilterKind::Plain("jobs/#")));
    assert_eq!(
        parse_filter("$share/g-1_x/a").map(|k| k.group()),
        Ok(Some("g-1_x"))
    );
}

#[test]
fn test_parse_filter_malformed_shared() {
    assert!(parse_filter("$share/workers/").is_err());
    assert!(parse_filter("$share/bad group/a").is_err());
    assert!(parse_filter("$share//a").is_err());
    assert!(parse_filter("$share/g/a/#/b").is_err());
    assert!(parse_filter("$share/").is_err());
}

#[test]
fn test_parse_filter_invalid_plain() {
    assert!(parse_filter("").is_err());
    assert!(parse_filter("a/b#").is_err());
}

// ============================================================================
// Property tests
// ============================================================================

fn level() -> impl Strategy<Value = String> {
    prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("".to_string())]
}

fn topic_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
}

fn filter_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(
            prop_oneof![level(), Just("+".to_string())],
            0..4,
        ),
        any::<bool>(),
    )
        .prop_filter_map("filter needs at least one level", |(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            if levels.is_empty() {
                None
            } else {
                Some(levels.join("/"))
            }
        })
}

proptest! {
    #[test]
    fn prop_tree_agrees_with_matcher(
        filters in prop::collection::vec(filter_strategy(), 1..8),
        topic in topic_strategy(),
    ) {
        let filters: HashSet<String> = filters.into_iter().collect();
        let engine: TopicEngine<String> = TopicEngine::new();
        let mut expected = HashSet::new();
        for filter in &filters {
            engine.subscribe(filter, QoS::AtMostOnce, Arc::new(filter.clone()));
            if topic_matches_filter(&topic, filter) {
                expected.insert(filter.clone());
            }
        }

        let found: Vec<String> = engine
            .subscribers(&topic, QoS::AtMostOnce)
            .into_iter()
            .map(|(s, _)| (*s).clone())
            .collect();
        let found_set: HashSet<String> = found.iter().cloned().collect();

        prop_assert_eq!(found.len(), expected.len());
        prop_assert_eq!(found_set, expected);
    }

    #[test]
    fn prop_unsubscribe_all_leaves_empty(
        filters in prop::collection::vec(filter_strategy(), 1..8),
        topic in topic_strategy(),
    ) {
        let engine: TopicEngine<String> = TopicEngine::new();
        let subs: Vec<_> = filters
            .iter()
            .map(|f| {
                let sub = Arc::new(f.clone());
                engine.subscribe(f, QoS::AtMostOnce, sub.clone());
                (f, sub)
            })
            .collect();
        for (filter, sub) in &subs {
            prop_assert!(engine.unsubscribe(filter, sub));
        }
        prop_assert_eq!(engine.subscription_count(), 0);
        prop_assert!(engine.subscribers(&topic, QoS::AtMostOnce).is_empty());
    }
}
