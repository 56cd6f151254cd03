//! Subscription trie
//!
//! A prefix tree keyed by topic level. Wildcard children live under the
//! literal `+` and `#` keys, so pruning treats every child uniformly.
//! Each node carries its local subscribers plus any shared-subscription
//! groups anchored at that filter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::Subscription;

/// A shared-subscription group anchored at one trie node
///
/// Holds the group members and the round-robin cursor used to pick the
/// single delivery target per matched publish.
#[derive(Debug, Default)]
pub(crate) struct SharedGroup {
    members: Vec<Subscription>,
    cursor: AtomicUsize,
}

impl SharedGroup {
    /// Add a member, replacing any previous subscription from the same client
    fn add(&mut self, subscription: Subscription) {
        self.members
            .retain(|s| s.client_id != subscription.client_id);
        self.members.push(subscription);
    }

    /// Remove a member; true if something was removed
    fn remove(&mut self, client_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|s| s.client_id.as_ref() != client_id);
        self.members.len() != before
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Pick the next member by round-robin
    fn select(&self) -> Option<&Subscription> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        self.members.get(idx)
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    /// Children indexed by topic level; `+` and `#` are ordinary keys
    children: AHashMap<CompactString, TrieNode>,
    /// Non-shared subscribers whose filter ends at this node
    subscribers: Vec<Subscription>,
    /// Shared groups whose filter ends at this node
    shared: AHashMap<Arc<str>, SharedGroup>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty() && self.shared.is_empty()
    }

    /// Emit this node's subscribers: all locals, one member per shared group
    fn collect<F>(&self, out: &mut F)
    where
        F: FnMut(&Subscription),
    {
        for sub in &self.subscribers {
            out(sub);
        }
        for group in self.shared.values() {
            if let Some(sub) = group.select() {
                out(sub);
            }
        }
    }
}

/// Trie over topic filters with regular and shared subscriptions
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTrie {
    root: TrieNode,
}

impl SubscriptionTrie {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription under `filter` (the inner filter for shared
    /// subscriptions). Re-subscribing replaces the previous entry for the
    /// same client (and group, if shared).
    pub(crate) fn insert(&mut self, filter: &str, subscription: Subscription) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(CompactString::new(level)).or_default();
        }

        match subscription.share_group.clone() {
            Some(group) => node.shared.entry(group).or_default().add(subscription),
            None => {
                node.subscribers
                    .retain(|s| s.client_id != subscription.client_id);
                node.subscribers.push(subscription);
            }
        }
    }

    /// Remove one client's subscription at `filter`; prunes nodes left
    /// empty along the path. Returns true if a subscription was removed.
    pub(crate) fn remove(
        &mut self,
        filter: &str,
        client_id: &str,
        share_group: Option<&str>,
    ) -> bool {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels, 0, client_id, share_group)
    }

    fn remove_recursive(
        node: &mut TrieNode,
        levels: &[&str],
        index: usize,
        client_id: &str,
        share_group: Option<&str>,
    ) -> bool {
        if index >= levels.len() {
            return match share_group {
                Some(group) => match node.shared.get_mut(group) {
                    Some(g) => {
                        let removed = g.remove(client_id);
                        if g.is_empty() {
                            node.shared.remove(group);
                        }
                        removed
                    }
                    None => false,
                },
                None => {
                    let before = node.subscribers.len();
                    node.subscribers.retain(|s| s.client_id.as_ref() != client_id);
                    node.subscribers.len() != before
                }
            };
        }

        let level = levels[index];
        let Some(child) = node.children.get_mut(level) else {
            return false;
        };

        let removed = Self::remove_recursive(child, levels, index + 1, client_id, share_group);
        if child.is_empty() {
            node.children.remove(level);
        }
        removed
    }

    /// Drop every subscription belonging to `client_id`, pruning emptied
    /// nodes on the way back up.
    pub(crate) fn remove_client(&mut self, client_id: &str) {
        Self::remove_client_recursive(&mut self.root, client_id);
    }

    fn remove_client_recursive(node: &mut TrieNode, client_id: &str) {
        node.subscribers.retain(|s| s.client_id.as_ref() != client_id);
        node.shared.retain(|_, group| {
            group.remove(client_id);
            !group.is_empty()
        });
        node.children.retain(|_, child| {
            Self::remove_client_recursive(child, client_id);
            !child.is_empty()
        });
    }

    /// Walk the trie for `topic`, invoking `callback` for every matching
    /// subscriber. Shared groups emit exactly one member per match.
    ///
    /// Topics whose first level starts with `$` are not matched by `+` or
    /// `#` at depth zero.
    pub(crate) fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Subscription),
    {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Subscription),
    {
        // Multi-level wildcard matches all remaining levels, including none
        if !(is_system_topic && index == 0) {
            if let Some(hash_child) = node.children.get("#") {
                hash_child.collect(callback);
            }
        }

        if index >= levels.len() {
            node.collect(callback);
            return;
        }

        let level = levels[index];

        if !(is_system_topic && index == 0) {
            if let Some(plus_child) = node.children.get("+") {
                Self::matches_recursive(plus_child, levels, index + 1, is_system_topic, callback);
            }
        }

        if level != "+" && level != "#" {
            if let Some(child) = node.children.get(level) {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }
    }

    /// Visit every subscription in the trie
    pub(crate) fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Subscription),
    {
        Self::for_each_recursive(&self.root, &mut visitor);
    }

    fn for_each_recursive<F>(node: &TrieNode, visitor: &mut F)
    where
        F: FnMut(&Subscription),
    {
        for sub in &node.subscribers {
            visitor(sub);
        }
        for group in node.shared.values() {
            for sub in &group.members {
                visitor(sub);
            }
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, visitor);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pruned_empty(&self) -> bool {
        self.root.is_empty()
    }
}
