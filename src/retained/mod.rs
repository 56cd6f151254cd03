//! Retained message store
//!
//! A topic trie holding at most one retained message per exact topic.
//! Matching honours the same wildcard and `$`-topic rules as the router.
//! Messages carrying a Message Expiry Interval are dropped lazily on read
//! and swept periodically by a background task.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use compact_str::CompactString;
use parking_lot::RwLock;
use serde::Deserialize;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::{Properties, Publish, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name, TopicError};

/// Retained store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetainedConfig {
    /// How often expired retained messages are swept (0 disables the sweep)
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RetainedConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// A retained message attached to one exact topic
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub created_at: Instant,
    /// Absolute deadline derived from the Message Expiry Interval
    pub expires_at: Option<Instant>,
}

impl RetainedMessage {
    fn from_publish(publish: &Publish) -> Self {
        let created_at = Instant::now();
        let expires_at = publish
            .properties
            .message_expiry_interval
            .filter(|&secs| secs > 0)
            .map(|secs| created_at + Duration::from_secs(secs as u64));

        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            properties: publish.properties.clone(),
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Default)]
struct RetainedNode {
    children: AHashMap<CompactString, RetainedNode>,
    message: Option<RetainedMessage>,
}

impl RetainedNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.message.is_none()
    }
}

/// Trie-indexed retained message store
pub struct RetainedStore {
    root: RwLock<RetainedNode>,
    count: AtomicUsize,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl RetainedStore {
    /// Create a store without a background sweep
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            root: RwLock::new(RetainedNode::default()),
            count: AtomicUsize::new(0),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a store and start the periodic expiry sweep
    ///
    /// Must be called from within a tokio runtime when
    /// `config.cleanup_interval` is non-zero.
    pub fn with_config(config: RetainedConfig) -> Arc<Self> {
        let store = Arc::new(Self::new());

        if !config.cleanup_interval.is_zero() {
            let sweep = store.clone();
            let mut shutdown_rx = store.shutdown.subscribe();
            let interval = config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let removed = sweep.cleanup_expired();
                            if removed > 0 {
                                debug!("Swept {} expired retained messages", removed);
                            }
                        }
                    }
                }
            });
        }

        store
    }

    /// Store the retained message carried by `publish`
    ///
    /// An empty payload deletes any retained message at that topic, per
    /// the MQTT retained-message rules.
    pub fn set(&self, publish: &Publish) -> Result<(), TopicError> {
        validate_topic_name(&publish.topic)?;

        if publish.payload.is_empty() {
            self.delete(&publish.topic)?;
            return Ok(());
        }

        let message = RetainedMessage::from_publish(publish);
        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in publish.topic.split('/') {
            node = node.children.entry(CompactString::new(level)).or_default();
        }
        if node.message.replace(message).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Exact-topic lookup; expired messages read as absent
    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        let root = self.root.read();
        let mut node = &*root;
        for level in topic.split('/') {
            node = node.children.get(level)?;
        }
        node.message
            .as_ref()
            .filter(|m| !m.is_expired(Instant::now()))
            .cloned()
    }

    /// Delete the retained message at `topic`, pruning emptied nodes.
    /// Returns Ok(true) if a message was removed.
    pub fn delete(&self, topic: &str) -> Result<bool, TopicError> {
        validate_topic_name(topic)?;

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut root = self.root.write();
        let removed = Self::delete_recursive(&mut root, &levels, 0);
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn delete_recursive(node: &mut RetainedNode, levels: &[&str], index: usize) -> bool {
        if index >= levels.len() {
            return node.message.take().is_some();
        }

        let Some(child) = node.children.get_mut(levels[index]) else {
            return false;
        };
        let removed = Self::delete_recursive(child, levels, index + 1);
        if child.is_empty() {
            node.children.remove(levels[index]);
        }
        removed
    }

    /// All retained messages whose topic matches `filter`
    ///
    /// The walk mirrors the router's: `+`/`#` at depth zero never match
    /// `$`-topics. Expired messages are skipped.
    pub fn matches(&self, filter: &str) -> Result<Vec<RetainedMessage>, TopicError> {
        validate_topic_filter(filter)?;

        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let now = Instant::now();
        let root = self.root.read();
        let mut result = Vec::new();
        Self::match_recursive(&root, &levels, 0, true, now, &mut result);
        Ok(result)
    }

    fn match_recursive(
        node: &RetainedNode,
        filter_levels: &[&str],
        index: usize,
        at_root: bool,
        now: Instant,
        result: &mut Vec<RetainedMessage>,
    ) {
        if index >= filter_levels.len() {
            if let Some(message) = node.message.as_ref().filter(|m| !m.is_expired(now)) {
                result.push(message.clone());
            }
            return;
        }

        match filter_levels[index] {
            "#" => Self::collect_subtree(node, at_root, now, result),
            "+" => {
                for (level, child) in &node.children {
                    if at_root && level.starts_with('$') {
                        continue;
                    }
                    Self::match_recursive(child, filter_levels, index + 1, false, now, result);
                }
            }
            level => {
                if let Some(child) = node.children.get(level) {
                    Self::match_recursive(child, filter_levels, index + 1, false, now, result);
                }
            }
        }
    }

    /// Collect every unexpired message in the subtree. At the trie root a
    /// `#` filter must not descend into `$`-prefixed branches.
    fn collect_subtree(
        node: &RetainedNode,
        at_root: bool,
        now: Instant,
        result: &mut Vec<RetainedMessage>,
    ) {
        if let Some(message) = node.message.as_ref().filter(|m| !m.is_expired(now)) {
            result.push(message.clone());
        }
        for (level, child) in &node.children {
            if at_root && level.starts_with('$') {
                continue;
            }
            Self::collect_subtree(child, false, now, result);
        }
    }

    /// Walk the whole trie removing expired messages; returns how many
    /// were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut root = self.root.write();
        let removed = Self::cleanup_recursive(&mut root, now);
        self.count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    fn cleanup_recursive(node: &mut RetainedNode, now: Instant) -> usize {
        let mut removed = 0;
        if node.message.as_ref().is_some_and(|m| m.is_expired(now)) {
            node.message = None;
            removed += 1;
        }
        node.children.retain(|_, child| {
            removed += Self::cleanup_recursive(child, now);
            !child.is_empty()
        });
        removed
    }

    /// Number of retained messages currently stored (expired messages not
    /// yet swept still count)
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweep; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetainedStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str, payload: &[u8]) -> Publish {
        Publish {
            topic: Arc::from(topic),
            payload: Bytes::copy_from_slice(payload),
            qos: QoS::AtLeastOnce,
            retain: true,
            ..Default::default()
        }
    }

    #[test]
    fn set_get_roundtrip() {
        let store = RetainedStore::new();
        store.set(&publish("a/b", b"hello")).unwrap();

        let message = store.get("a/b").unwrap();
        assert_eq!(message.payload.as_ref(), b"hello");
        assert_eq!(store.len(), 1);
        assert!(store.get("a/c").is_none());
    }

    #[test]
    fn replace_keeps_single_message_per_topic() {
        let store = RetainedStore::new();
        store.set(&publish("a/b", b"one")).unwrap();
        store.set(&publish("a/b", b"two")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a/b").unwrap().payload.as_ref(), b"two");
    }

    #[test]
    fn empty_payload_deletes() {
        let store = RetainedStore::new();
        store.set(&publish("a/b", b"x")).unwrap();
        store.set(&publish("a/b", b"")).unwrap();

        assert!(store.get("a/b").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn delete_is_idempotent_and_prunes() {
        let store = RetainedStore::new();
        store.set(&publish("a/b/c", b"x")).unwrap();

        assert!(store.delete("a/b/c").unwrap());
        assert!(!store.delete("a/b/c").unwrap());
        assert!(store.root.read().is_empty());
    }

    #[test]
    fn wildcard_matching() {
        let store = RetainedStore::new();
        store.set(&publish("sport/tennis/p1", b"a")).unwrap();
        store.set(&publish("sport/tennis/p2", b"b")).unwrap();
        store.set(&publish("sport/golf/p1", b"c")).unwrap();

        let mut topics: Vec<String> = store
            .matches("sport/tennis/+")
            .unwrap()
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["sport/tennis/p1", "sport/tennis/p2"]);

        assert_eq!(store.matches("sport/#").unwrap().len(), 3);
        assert_eq!(store.matches("sport/golf/p1").unwrap().len(), 1);
    }

    #[test]
    fn system_topics_hidden_from_root_wildcards() {
        let store = RetainedStore::new();
        store.set(&publish("$SYS/broker/uptime", b"1")).unwrap();
        store.set(&publish("app/status", b"2")).unwrap();

        assert_eq!(store.matches("#").unwrap().len(), 1);
        assert!(store.matches("+/broker/uptime").unwrap().is_empty());
        assert_eq!(store.matches("$SYS/#").unwrap().len(), 1);
        assert_eq!(store.matches("$SYS/broker/+").unwrap().len(), 1);
    }

    #[test]
    fn expiry_hides_and_sweeps() {
        let store = RetainedStore::new();
        let mut msg = publish("a/b", b"x");
        msg.properties.message_expiry_interval = Some(1);
        store.set(&msg).unwrap();

        // Not yet expired
        assert!(store.get("a/b").is_some());

        // Force the deadline into the past
        {
            let mut root = store.root.write();
            let node = root.children.get_mut("a").unwrap().children.get_mut("b").unwrap();
            node.message.as_mut().unwrap().expires_at =
                Some(Instant::now() - Duration::from_secs(1));
        }

        assert!(store.get("a/b").is_none());
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 0);
        assert!(store.root.read().is_empty());
    }
}
