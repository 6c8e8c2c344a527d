//! Hierarchical topic tree.
//!
//! Topics are slash delimited paths. A node subscribed at a path receives
//! every publish addressed to that path or anything below it; the root
//! (the empty topic) receives everything. Tree nodes are created lazily on
//! subscribe and are never pruned.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::message::NodeId;

/// Topic separator.
pub const SEPARATOR: char = '/';

/// Topic tree errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// No tree node exists at this path.
    #[error("Unknown topic: {0:?}")]
    UnknownTopic(String),

    /// The node is not subscribed at this path.
    #[error("{node} is not subscribed to {topic:?}")]
    NotSubscribed {
        /// Topic path.
        topic: String,
        /// Node that asked to leave.
        node: NodeId,
    },
}

/// Split a topic into path segments.
///
/// Any string is a topic. Only the empty topic is special: it is the root
/// and has no segments. Empty segments (`"a/"`, `"a//b"`) are ordinary
/// path components.
fn segments(topic: &str) -> impl Iterator<Item = &str> {
    let topic = if topic.is_empty() { None } else { Some(topic) };
    topic.into_iter().flat_map(|t| t.split(SEPARATOR))
}

#[derive(Debug, Default)]
struct TopicNode {
    children: HashMap<String, TopicNode>,
    subscribers: HashSet<NodeId>,
}

impl TopicNode {
    fn collect_topics(&self, path: &str, node: &str, out: &mut Vec<String>) {
        if self.subscribers.contains(node) {
            out.push(path.to_string());
        }
        for (segment, child) in &self.children {
            let child_path = if path.is_empty() {
                segment.clone()
            } else {
                format!("{path}{SEPARATOR}{segment}")
            };
            child.collect_topics(&child_path, node, out);
        }
    }
}

/// Topic tree statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopicStats {
    /// Number of tree nodes below the root.
    pub topics: usize,
    /// Number of (topic, node) subscriptions, root included.
    pub subscriptions: usize,
}

/// Subscriber registry keyed by topic path.
///
/// The tree has a single owner, the broker, and is not synchronized.
#[derive(Debug, Default)]
pub struct TopicTree {
    root: TopicNode,
    stats: TopicStats,
}

impl TopicTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `node` at `topic`, creating intermediate tree nodes.
    ///
    /// Returns `false` if the node was already subscribed there.
    pub fn add_subscriber(&mut self, topic: &str, node: &str) -> bool {
        let mut current = &mut self.root;
        for segment in segments(topic) {
            current = current
                .children
                .entry(segment.to_string())
                .or_insert_with(|| {
                    self.stats.topics += 1;
                    TopicNode::default()
                });
        }

        let inserted = current.subscribers.insert(node.to_string());
        if inserted {
            self.stats.subscriptions += 1;
        }
        inserted
    }

    /// Unsubscribe `node` from exactly `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or `node` is not
    /// subscribed there. The tree is left unchanged in both cases.
    pub fn remove_subscriber(&mut self, topic: &str, node: &str) -> Result<(), TopicError> {
        let mut current = &mut self.root;
        for segment in segments(topic) {
            current = current
                .children
                .get_mut(segment)
                .ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))?;
        }

        if !current.subscribers.remove(node) {
            return Err(TopicError::NotSubscribed {
                topic: topic.to_string(),
                node: node.to_string(),
            });
        }
        self.stats.subscriptions -= 1;
        Ok(())
    }

    /// Collect every node subscribed at the root or along the path to `topic`.
    ///
    /// Stops where the path leaves the tree.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> HashSet<&str> {
        let mut targets: HashSet<&str> = self.root.subscribers.iter().map(String::as_str).collect();

        let mut current = &self.root;
        for segment in segments(topic) {
            match current.children.get(segment) {
                Some(child) => {
                    targets.extend(child.subscribers.iter().map(String::as_str));
                    current = child;
                }
                None => break,
            }
        }

        targets
    }

    /// Get every topic `node` is subscribed at, sorted.
    #[must_use]
    pub fn subscriptions_of(&self, node: &str) -> Vec<String> {
        let mut topics = Vec::new();
        self.root.collect_topics("", node, &mut topics);
        topics.sort();
        topics
    }

    /// Get tree statistics.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(targets: HashSet<&str>) -> Vec<&str> {
        let mut v: Vec<_> = targets.into_iter().collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_prefix_delivery() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("", "monitor");
        tree.add_subscriber("lidar", "mapper");
        tree.add_subscriber("lidar/scan", "estimator");
        tree.add_subscriber("lidar/scan/raw", "recorder");

        assert_eq!(
            sorted(tree.resolve("lidar/scan")),
            vec!["estimator", "mapper", "monitor"]
        );
        assert_eq!(
            sorted(tree.resolve("lidar/scan/raw/extra")),
            vec!["estimator", "mapper", "monitor", "recorder"]
        );
        assert_eq!(sorted(tree.resolve("")), vec!["monitor"]);
    }

    #[test]
    fn test_non_delivery_outside_prefix() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("x/y", "node-d");

        assert!(tree.resolve("z").is_empty());
        assert!(tree.resolve("x").is_empty());
        assert!(tree.resolve("x/z").is_empty());
        assert_eq!(sorted(tree.resolve("x/y/w")), vec!["node-d"]);
    }

    #[test]
    fn test_unknown_path_yields_collected_prefix() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("a", "node-a");

        assert_eq!(sorted(tree.resolve("a/never/seen")), vec!["node-a"]);
        assert!(tree.resolve("b/never/seen").is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut tree = TopicTree::new();
        assert!(tree.add_subscriber("a/b", "n"));
        assert!(!tree.add_subscriber("a/b", "n"));
        assert_eq!(
            tree.stats(),
            TopicStats {
                topics: 2,
                subscriptions: 1
            }
        );
    }

    #[test]
    fn test_remove_subscriber() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("a/b", "n");

        assert_eq!(
            tree.remove_subscriber("a/c", "n"),
            Err(TopicError::UnknownTopic("a/c".to_string()))
        );
        assert!(matches!(
            tree.remove_subscriber("a", "n"),
            Err(TopicError::NotSubscribed { .. })
        ));

        tree.remove_subscriber("a/b", "n").unwrap();
        assert!(tree.resolve("a/b").is_empty());

        // Second removal fails without panicking.
        assert!(matches!(
            tree.remove_subscriber("a/b", "n"),
            Err(TopicError::NotSubscribed { .. })
        ));

        // Nodes are never pruned.
        assert_eq!(tree.stats().topics, 2);
        assert_eq!(tree.stats().subscriptions, 0);
    }

    #[test]
    fn test_root_subscription() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("", "monitor");
        assert_eq!(sorted(tree.resolve("anything/at/all")), vec!["monitor"]);

        tree.remove_subscriber("", "monitor").unwrap();
        assert!(tree.resolve("anything").is_empty());
        assert_eq!(tree.stats().topics, 0);
    }

    #[test]
    fn test_subscriptions_of() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("", "n");
        tree.add_subscriber("slam/pose", "n");
        tree.add_subscriber("lidar", "n");
        tree.add_subscriber("lidar/scan", "other");

        assert_eq!(tree.subscriptions_of("n"), vec!["", "lidar", "slam/pose"]);
        assert_eq!(tree.subscriptions_of("other"), vec!["lidar/scan"]);
        assert!(tree.subscriptions_of("nobody").is_empty());
    }

    #[test]
    fn test_empty_segments_are_distinct_paths() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("a/", "trailing");
        tree.add_subscriber("a", "plain");
        tree.add_subscriber("/a", "leading");

        assert_eq!(sorted(tree.resolve("a/")), vec!["plain", "trailing"]);
        assert_eq!(sorted(tree.resolve("a")), vec!["plain"]);
        assert_eq!(sorted(tree.resolve("/a/b")), vec!["leading"]);
        assert_eq!(tree.subscriptions_of("trailing"), vec!["a/"]);
        assert_eq!(tree.stats().topics, 4);
    }

    #[test]
    fn test_unicode_topics() {
        let mut tree = TopicTree::new();
        tree.add_subscriber("capteurs/température", "n");
        assert_eq!(sorted(tree.resolve("capteurs/température/salon")), vec!["n"]);
        assert!(tree.resolve("capteurs/temperature").is_empty());
    }
}
