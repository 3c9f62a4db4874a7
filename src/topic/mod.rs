//! Topic matching and subscription management
//!
//! Maps topic filters to subscriber lists through the topic trie and
//! answers "who gets this message" for the fan-out engine.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Client ID
    pub client_id: Arc<str>,
    /// Granted QoS for this subscription
    pub qos: QoS,
}

/// Thread-safe subscription store backed by the topic trie
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscriber>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add or refresh a subscription for a client
    pub fn subscribe(&self, filter: &str, subscriber: Subscriber) {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            subs.retain(|s| s.client_id != subscriber.client_id);
            subs.push(subscriber);
        } else {
            trie.insert(filter, vec![subscriber]);
        }
    }

    /// Remove one client's subscription to a filter; true if it existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            let before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != before;
            if subs.is_empty() {
                trie.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    /// Remove every subscription held by a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Collect every subscriber whose filter matches a topic name. A client
    /// subscribed through several overlapping filters appears once per
    /// filter; the fan-out engine deduplicates.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 8]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscriber; 8]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
