use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use smallvec::SmallVec;

use iris_core::qos::QoS;

/// One client's membership in a topic's subscriber set.
///
/// A wildcard subscription installs the same record under every matching
/// topic; `refs` counts the installs so that removal from one topic leaves
/// the record valid for the others.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub client_id: String,
    pub qos: QoS,
    refs: AtomicU32,
}

impl Subscriber {
    pub(crate) fn new(client_id: &str, qos: QoS) -> Arc<Subscriber> {
        Arc::new(Subscriber {
            client_id: client_id.to_string(),
            qos,
            refs: AtomicU32::new(0),
        })
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }
}

/// A topic node payload: the subscriber set and the retained message.
#[derive(Debug, Default)]
pub(crate) struct Topic {
    pub name: String,
    pub subscribers: HashMap<String, Arc<Subscriber>>,
    /// Last retained PUBLISH for this topic, in pre-encoded wire form.
    pub retained: Option<Bytes>,
}

impl Topic {
    fn new(name: &str) -> Topic {
        Topic {
            name: name.to_string(),
            subscribers: HashMap::new(),
            retained: None,
        }
    }

    /// Install a subscriber record, replacing any previous subscription the
    /// same client held on this topic.
    pub(crate) fn install(&mut self, subscriber: Arc<Subscriber>) {
        subscriber.refs.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self
            .subscribers
            .insert(subscriber.client_id.clone(), subscriber)
        {
            old.refs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Remove a client from this topic's subscriber set.
    pub(crate) fn remove(&mut self, client_id: &str) -> bool {
        match self.subscribers.remove(client_id) {
            Some(old) => {
                old.refs.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Node {
    topic: Option<Topic>,
    children: HashMap<String, Node>,
}

/// Trie over `/`-separated topic path segments.
///
/// Topic names are stored normalised (trailing `/`); the root corresponds to
/// the name `/`.
#[derive(Debug, Default)]
pub(crate) struct TopicTree {
    root: Node,
}

fn segments(name: &str) -> SmallVec<[&str; 8]> {
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    if trimmed.is_empty() {
        SmallVec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl TopicTree {
    pub(crate) fn new() -> TopicTree {
        TopicTree::default()
    }

    /// Look up a topic by normalised name.
    pub(crate) fn get(&self, name: &str) -> Option<&Topic> {
        let mut node = &self.root;
        for segment in segments(name) {
            node = node.children.get(segment)?;
        }
        node.topic.as_ref()
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Topic> {
        let mut node = &mut self.root;
        for segment in segments(name) {
            node = node.children.get_mut(segment)?;
        }
        node.topic.as_mut()
    }

    /// Look up a topic by normalised name, creating it (and any missing
    /// intermediate nodes) on the way.
    pub(crate) fn get_or_create(&mut self, name: &str) -> &mut Topic {
        let mut node = &mut self.root;
        for segment in segments(name) {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(Node::default);
        }

        node.topic.get_or_insert_with(|| Topic::new(name))
    }

    /// Invoke `f` on every topic at or below `prefix`.
    ///
    /// Nodes without a payload are traversed but not visited.
    pub(crate) fn prefix_map<F>(&mut self, prefix: &str, mut f: F)
    where
        F: FnMut(&mut Topic),
    {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }

        visit(node, &mut f);
    }
}

fn visit<F>(node: &mut Node, f: &mut F)
where
    F: FnMut(&mut Topic),
{
    if let Some(topic) = &mut node.topic {
        f(topic);
    }
    for child in node.children.values_mut() {
        visit(child, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_then_get() {
        let mut tree = TopicTree::new();

        assert!(tree.get("a/b/").is_none());

        tree.get_or_create("a/b/").retained = Some(Bytes::from_static(b"m"));
        assert_eq!(
            tree.get("a/b/").unwrap().retained.as_ref().unwrap().as_ref(),
            b"m"
        );

        // Intermediate nodes carry no payload.
        assert!(tree.get("a/").is_none());
    }

    #[test]
    fn test_distinct_leading_separator() {
        let mut tree = TopicTree::new();
        tree.get_or_create("a/b/");
        tree.get_or_create("/a/b/");

        assert_eq!(tree.get("a/b/").unwrap().name, "a/b/");
        assert_eq!(tree.get("/a/b/").unwrap().name, "/a/b/");
    }

    #[test]
    fn test_prefix_map_visits_descendants() {
        let mut tree = TopicTree::new();
        tree.get_or_create("a/");
        tree.get_or_create("a/b/");
        tree.get_or_create("a/b/c/");
        tree.get_or_create("d/");

        let mut visited = Vec::new();
        tree.prefix_map("a/", |topic| visited.push(topic.name.clone()));

        visited.sort();
        assert_eq!(visited, vec!["a/", "a/b/", "a/b/c/"]);
    }

    #[test]
    fn test_prefix_map_from_root() {
        let mut tree = TopicTree::new();
        tree.get_or_create("a/");
        tree.get_or_create("d/e/");

        let mut count = 0;
        tree.prefix_map("/", |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_prefix_map_missing_prefix_is_noop() {
        let mut tree = TopicTree::new();
        tree.get_or_create("a/");

        let mut count = 0;
        tree.prefix_map("z/", |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_shared_subscriber_refs() {
        let mut tree = TopicTree::new();
        tree.get_or_create("a/b/");
        tree.get_or_create("a/c/");

        let record = Subscriber::new("c1", QoS::AtLeastOnce);
        tree.prefix_map("a/", |topic| topic.install(Arc::clone(&record)));

        assert_eq!(record.refs(), 2);

        tree.get_mut("a/b/").unwrap().remove("c1");
        assert_eq!(record.refs(), 1);

        // The record is still installed under the sibling topic.
        assert!(tree.get("a/c/").unwrap().subscribers.contains_key("c1"));
    }

    #[test]
    fn test_install_replaces_previous_subscription() {
        let mut tree = TopicTree::new();
        let topic = tree.get_or_create("t/");

        let first = Subscriber::new("c1", QoS::AtMostOnce);
        topic.install(Arc::clone(&first));
        let second = Subscriber::new("c1", QoS::ExactlyOnce);
        topic.install(Arc::clone(&second));

        assert_eq!(topic.subscribers.len(), 1);
        assert_eq!(topic.subscribers["c1"].qos, QoS::ExactlyOnce);
        assert_eq!(first.refs(), 0);
        assert_eq!(second.refs(), 1);
    }
}
