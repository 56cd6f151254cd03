//! Topic routing engine
//!
//! The [`Router`] owns the subscription trie and a per-client catalog of
//! subscriptions. Publishes are matched against the trie (wildcards,
//! shared-subscription round-robin, `$`-topic exclusion); the catalog
//! gives O(subscriptions) cleanup when a client disconnects.

mod trie;

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{Publish, QoS, RetainHandling, SubscriptionOptions};
use crate::retained::{RetainedMessage, RetainedStore};
use crate::topic::{parse_shared_subscription, validate_topic_filter, validate_topic_name, TopicError};

use trie::SubscriptionTrie;

/// A single client subscription
///
/// Immutable once created; re-subscribing to the same filter replaces it.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: Arc<str>,
    /// The filter as the client sent it (includes any `$share/` prefix)
    pub topic_filter: String,
    /// Granted QoS
    pub qos: QoS,
    /// No local flag (v5.0) - don't echo messages back to the publisher
    pub no_local: bool,
    /// Retain as published flag (v5.0)
    pub retain_as_published: bool,
    /// Retain handling (v5.0)
    pub retain_handling: RetainHandling,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
    /// Share group name for shared subscriptions
    pub share_group: Option<Arc<str>>,
}

/// Per-client delivery target after collapsing multiple matching filters
///
/// When one client matches a publish through several filters it receives a
/// single message at the highest granted QoS, carrying the union of the
/// matched subscription identifiers.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub client_id: Arc<str>,
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 4]>,
}

/// Trie-backed subscription router
pub struct Router {
    trie: RwLock<SubscriptionTrie>,
    /// client_id -> original filter -> subscription
    catalog: DashMap<Arc<str>, AHashMap<String, Subscription>>,
    /// Retained store fed by RETAIN publishes and drained on subscribe
    retained: Option<Arc<RetainedStore>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(SubscriptionTrie::new()),
            catalog: DashMap::new(),
            retained: None,
        }
    }

    /// A router wired to a retained store: RETAIN publishes flow into it
    /// and new subscriptions pull their retained matches from it.
    pub fn with_retained(retained: Arc<RetainedStore>) -> Self {
        Self {
            trie: RwLock::new(SubscriptionTrie::new()),
            catalog: DashMap::new(),
            retained: Some(retained),
        }
    }

    /// Add (or replace) a subscription
    ///
    /// `filter` may be a shared-subscription filter
    /// (`$share/{group}/{filter}`); the trie is keyed by the inner filter
    /// and the group travels with the subscription.
    /// Returns true when the subscription is new, false when it replaced
    /// an existing one on the same filter (relevant for retain handling).
    pub fn subscribe(
        &self,
        client_id: Arc<str>,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> Result<bool, TopicError> {
        validate_topic_filter(filter)?;

        let (share_group, actual_filter) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (Some(Arc::<str>::from(group)), actual),
            None => (None, filter),
        };

        let subscription = Subscription {
            client_id: client_id.clone(),
            topic_filter: filter.to_string(),
            qos: options.qos,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            retain_handling: options.retain_handling,
            subscription_id,
            share_group,
        };

        self.trie.write().insert(actual_filter, subscription.clone());
        let previous = self
            .catalog
            .entry(client_id)
            .or_default()
            .insert(filter.to_string(), subscription);
        Ok(previous.is_none())
    }

    /// Remove a subscription; Ok(false) when none existed (idempotent)
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, TopicError> {
        validate_topic_filter(filter)?;

        let (share_group, actual_filter) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (Some(group), actual),
            None => (None, filter),
        };

        let removed = self
            .trie
            .write()
            .remove(actual_filter, client_id, share_group);

        if let Some(mut filters) = self.catalog.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                drop(filters);
                self.catalog.remove_if(client_id, |_, f| f.is_empty());
            }
        }

        Ok(removed)
    }

    /// Remove every subscription held by `client_id`
    pub fn unsubscribe_all(&self, client_id: &str) {
        self.trie.write().remove_client(client_id);
        self.catalog.remove(client_id);
    }

    /// All subscriptions currently held by `client_id`
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        self.catalog
            .get(client_id)
            .map(|filters| filters.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Find all subscribers matching `topic`
    ///
    /// Shared groups contribute exactly one member each, chosen by the
    /// group's round-robin cursor.
    pub fn matches(&self, topic: &str) -> Result<SmallVec<[Subscription; 16]>, TopicError> {
        validate_topic_name(topic)?;

        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |sub| result.push(sub.clone()));
        Ok(result)
    }

    /// Like [`matches`](Self::matches) but drops subscribers that set
    /// `no_local` and are the publisher themselves.
    pub fn match_with_publisher(
        &self,
        topic: &str,
        publisher_id: &str,
    ) -> Result<SmallVec<[Subscription; 16]>, TopicError> {
        validate_topic_name(topic)?;

        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |sub| {
            if sub.no_local && sub.client_id.as_ref() == publisher_id {
                return;
            }
            result.push(sub.clone());
        });
        Ok(result)
    }

    /// Match `topic` and collapse the result to one delivery target per
    /// client: highest QoS wins, subscription identifiers accumulate, and
    /// `retain_as_published` is sticky if any matched filter set it.
    pub fn route_targets(
        &self,
        topic: &str,
        publisher_id: Option<&str>,
    ) -> Result<Vec<RouteTarget>, TopicError> {
        let matches = match publisher_id {
            Some(publisher) => self.match_with_publisher(topic, publisher)?,
            None => self.matches(topic)?,
        };

        let mut per_client: AHashMap<Arc<str>, RouteTarget> =
            AHashMap::with_capacity(matches.len());
        for sub in matches {
            let entry = per_client
                .entry(sub.client_id.clone())
                .or_insert_with(|| RouteTarget {
                    client_id: sub.client_id.clone(),
                    qos: QoS::AtMostOnce,
                    retain_as_published: false,
                    subscription_ids: SmallVec::new(),
                });

            if sub.qos > entry.qos {
                entry.qos = sub.qos;
            }
            if sub.retain_as_published {
                entry.retain_as_published = true;
            }
            if let Some(id) = sub.subscription_id {
                if !entry.subscription_ids.contains(&id) {
                    entry.subscription_ids.push(id);
                }
            }
        }

        Ok(per_client.into_values().collect())
    }

    /// Store (or, for an empty payload, clear) the retained message a
    /// RETAIN publish carries. No-op without a wired retained store.
    pub fn set_retained(&self, publish: &Publish) -> Result<(), TopicError> {
        match &self.retained {
            Some(store) => store.set(publish),
            None => Ok(()),
        }
    }

    /// Retained messages owed to a subscription that just landed
    ///
    /// Applies the subscription's retain-handling option: always send,
    /// send only when the subscription is new, or never. Shared
    /// subscriptions never receive retained messages.
    pub fn retained_for(
        &self,
        filter: &str,
        retain_handling: RetainHandling,
        is_new_subscription: bool,
    ) -> Result<Vec<RetainedMessage>, TopicError> {
        let Some(store) = &self.retained else {
            return Ok(Vec::new());
        };

        let send = match retain_handling {
            RetainHandling::SendAtSubscribe => true,
            RetainHandling::SendAtSubscribeIfNew => is_new_subscription,
            RetainHandling::DoNotSend => false,
        };
        if !send || parse_shared_subscription(filter).is_some() {
            return Ok(Vec::new());
        }

        store.matches(filter)
    }

    /// Total number of subscriptions in the trie
    pub fn subscription_count(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|_| count += 1);
        count
    }

    /// Number of clients with at least one subscription
    pub fn client_count(&self) -> usize {
        self.catalog.len()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
