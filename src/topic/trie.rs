//! Topic trie for subscription matching
//!
//! A prefix tree over `/`-separated topic levels. Filters may contain the
//! MQTT wildcards: `+` matches exactly one level, `#` matches the rest of
//! the topic. Matching walks an explicit work stack instead of recursing,
//! since a topic with many levels would otherwise fan out one stack frame
//! per wildcard branch.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct Node<V> {
    /// Value for a filter ending at this node
    value: Option<V>,
    /// Literal children keyed by level (CompactString keeps short levels inline)
    children: AHashMap<CompactString, Node<V>>,
    /// Child reached through a `+` level
    plus: Option<Box<Node<V>>>,
    /// Value for a filter ending in `#` at this node
    hash: Option<V>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            plus: None,
            hash: None,
        }
    }

    fn remove(&mut self, levels: &[&str]) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return self.value.take();
        };

        match *level {
            "#" => self.hash.take(),
            "+" => {
                let child = self.plus.as_mut()?;
                if rest.is_empty() {
                    child.value.take()
                } else {
                    child.remove(rest)
                }
            }
            _ => {
                let child = self.children.get_mut(*level)?;
                if rest.is_empty() {
                    child.value.take()
                } else {
                    child.remove(rest)
                }
            }
        }
    }

    fn prune(&mut self, pred: &mut impl FnMut(&mut V) -> bool) {
        if let Some(v) = self.value.as_mut() {
            if pred(v) {
                self.value = None;
            }
        }
        if let Some(v) = self.hash.as_mut() {
            if pred(v) {
                self.hash = None;
            }
        }
        if let Some(child) = self.plus.as_mut() {
            child.prune(pred);
        }
        for child in self.children.values_mut() {
            child.prune(pred);
        }
    }
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie mapping filters to subscription values
#[derive(Debug, Default)]
pub struct TopicTrie<V> {
    root: Node<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    /// Insert a filter, replacing any value already stored for it
    pub fn insert(&mut self, filter: &str, value: V) {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                node.hash = Some(value);
                return;
            }

            node = if level == "+" {
                node.plus.get_or_insert_with(|| Box::new(Node::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                node.value = Some(value);
                return;
            }
        }
    }

    /// Mutable access to the value stored for an exact filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.hash.as_mut();
            }

            node = if level == "+" {
                node.plus.as_mut()?
            } else {
                node.children.get_mut(level)?
            };

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }
        None
    }

    /// Remove a filter, returning its value
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        self.root.remove(&levels)
    }

    /// Drop every value the predicate returns true for
    pub fn remove_by_predicate(&mut self, mut pred: impl FnMut(&mut V) -> bool) {
        self.root.prune(&mut pred);
    }

    /// Invoke the callback for every filter value matching a topic name
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        // Per MQTT-4.7.2-1: a $-prefixed topic never matches a filter whose
        // first level is a wildcard
        let shield_root = topic.starts_with('$');

        // (node, next level index) pairs still to visit
        let mut work: SmallVec<[(&Node<V>, usize); 16]> = SmallVec::new();
        work.push((&self.root, 0));

        while let Some((node, index)) = work.pop() {
            let wildcards_ok = !(shield_root && index == 0);

            if wildcards_ok {
                if let Some(v) = node.hash.as_ref() {
                    callback(v);
                }
            }

            let Some(level) = levels.get(index) else {
                if let Some(v) = node.value.as_ref() {
                    callback(v);
                }
                continue;
            };

            if wildcards_ok {
                if let Some(child) = node.plus.as_ref() {
                    work.push((child, index + 1));
                }
            }
            if let Some(child) = node.children.get(*level) {
                work.push((child, index + 1));
            }
        }
    }
}
