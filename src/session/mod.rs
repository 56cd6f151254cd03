//! Client session state
//!
//! A [`Session`] is the durable per-client record: subscriptions, pending
//! QoS queues, will message and the packet-identifier counter. Sessions
//! are owned by a [`SessionStore`](store::SessionStore) and cached by the
//! [`SessionManager`](manager::SessionManager) while active; callers hold
//! them as `Arc<RwLock<Session>>`.

pub mod fjall;
pub mod manager;
mod models;
pub mod store;

pub use manager::{ExpiryConfig, NoopWillPublisher, SessionManager, WillPublisher};
pub use models::StoredSession;
pub use store::{MemorySessionStore, SessionStore, StoreError};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, Will};
use crate::router::Subscription;

/// Session errors
#[derive(Debug)]
pub enum SessionError {
    /// No session for the given client id
    NotFound,
    /// Client-id generation exhausted its collision retries
    AlreadyExists,
    /// The backing store failed
    Store(StoreError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "session not found"),
            Self::AlreadyExists => write!(f, "session already exists"),
            Self::Store(e) => write!(f, "session store error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created but never activated
    New = 0,
    /// A client is connected and using the session
    Active = 1,
    /// Client gone; session persists until expiry
    Disconnected = 2,
    /// Marked expired; terminal
    Expired = 3,
}

impl SessionState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SessionState::New),
            1 => Some(SessionState::Active),
            2 => Some(SessionState::Disconnected),
            3 => Some(SessionState::Expired),
            _ => None,
        }
    }
}

/// An outbound QoS 1/2 message awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub packet_id: u16,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
    pub created_at: Instant,
    pub last_attempt_at: Instant,
    pub attempt_count: u32,
    /// Message expiry in seconds (zero = never)
    pub expiry_interval: u32,
}

impl PendingMessage {
    pub fn new(
        packet_id: u16,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Self {
        let expiry_interval = properties.message_expiry_interval.unwrap_or(0);
        let now = Instant::now();
        Self {
            packet_id,
            topic,
            payload,
            qos,
            retain,
            dup: false,
            properties,
            created_at: now,
            last_attempt_at: now,
            attempt_count: 0,
            expiry_interval,
        }
    }

    /// Record a retransmission attempt: bump the counter, set DUP, stamp
    /// the attempt time.
    pub fn mark_attempt(&mut self) {
        self.attempt_count += 1;
        self.dup = true;
        self.last_attempt_at = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry_interval > 0
            && now.duration_since(self.created_at) >= Duration::from_secs(self.expiry_interval as u64)
    }

    /// The decoded PUBLISH this pending message retransmits
    pub fn to_publish(&self) -> crate::protocol::Publish {
        crate::protocol::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: Some(self.packet_id),
            payload: self.payload.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Maximum value the session expiry interval can take; MQTT 5 treats it
/// as "session never expires".
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Per-client session
///
/// All field access is serialised by the `RwLock` the owner wraps the
/// session in; the struct itself is plain data. Cloning snapshots the
/// session for persistence without holding its lock across I/O.
#[derive(Clone)]
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Protocol version negotiated on CONNECT
    pub protocol_version: ProtocolVersion,
    /// Lifecycle state
    pub state: SessionState,
    /// Clean start flag from the owning CONNECT
    pub clean_start: bool,
    /// Session expiry in seconds; zero with clean_start=false persists forever
    pub expiry_interval: u32,
    /// Creation time
    pub created_at: Instant,
    /// Last time the session was touched
    pub last_accessed_at: Instant,
    /// When the client disconnected, if it has
    pub disconnected_at: Option<Instant>,
    /// Will message published on ungraceful disconnect
    pub will: Option<Will>,
    /// Delay before the will fires (seconds)
    pub will_delay_interval: u32,
    /// Subscriptions keyed by the original topic filter
    pub subscriptions: AHashMap<String, Subscription>,
    /// Outbound QoS 1 messages awaiting PUBACK
    pub pending_qos1: AHashMap<u16, PendingMessage>,
    /// Outbound QoS 2 messages awaiting PUBREC
    pub pending_qos2: AHashMap<u16, PendingMessage>,
    /// Outbound QoS 2 ids that got PUBREC and await PUBCOMP
    pub pending_pubcomp: AHashSet<u16>,
    /// Inbound QoS 2 publish ids awaiting PUBREL
    pub pending_pubrel: AHashSet<u16>,
    /// Messages queued while the client is disconnected
    pub queued_messages: VecDeque<Publish>,
    /// Cap on the offline queue; the oldest message is dropped at capacity
    pub max_queued_messages: usize,
    /// Receive maximum granted to the peer
    pub receive_maximum: u16,
    /// Maximum packet size granted to the peer
    pub max_packet_size: u32,
    next_packet_id: u16,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            protocol_version,
            state: SessionState::New,
            clean_start: true,
            expiry_interval: 0,
            created_at: now,
            last_accessed_at: now,
            disconnected_at: None,
            will: None,
            will_delay_interval: 0,
            subscriptions: AHashMap::new(),
            pending_qos1: AHashMap::new(),
            pending_qos2: AHashMap::new(),
            pending_pubcomp: AHashSet::new(),
            pending_pubrel: AHashSet::new(),
            queued_messages: VecDeque::new(),
            max_queued_messages: 1000,
            receive_maximum: 65535,
            max_packet_size: 268_435_455,
            next_packet_id: 1,
        }
    }

    /// Mark the session in use by a connected client
    pub fn set_active(&mut self) {
        self.state = SessionState::Active;
        self.disconnected_at = None;
        self.touch();
    }

    /// Mark the session disconnected and stamp the disconnect time
    pub fn set_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
        self.touch();
    }

    /// Mark the session expired; terminal
    pub fn set_expired(&mut self) {
        self.state = SessionState::Expired;
    }

    /// Update the last-accessed timestamp
    pub fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
    }

    /// Whether the session has expired at `now`
    ///
    /// Only disconnected sessions age out; `expiry_interval` of zero or
    /// [`EXPIRY_NEVER`] never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.state {
            SessionState::Expired => true,
            SessionState::Disconnected => {
                if self.expiry_interval == 0 || self.expiry_interval == EXPIRY_NEVER {
                    return false;
                }
                match self.disconnected_at {
                    Some(at) => {
                        now.duration_since(at)
                            > Duration::from_secs(self.expiry_interval as u64)
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Next free packet identifier
    ///
    /// Advances from the current counter value, wraps 65535 -> 1, never
    /// returns zero, and skips any id held by a pending container.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id {
                u16::MAX => 1,
                n => n + 1,
            };

            if !self.packet_id_in_use(id) {
                return id;
            }
        }
    }

    fn packet_id_in_use(&self, id: u16) -> bool {
        self.pending_qos1.contains_key(&id)
            || self.pending_qos2.contains_key(&id)
            || self.pending_pubcomp.contains(&id)
            || self.pending_pubrel.contains(&id)
    }

    /// Raw counter value, for persistence
    pub(crate) fn packet_id_counter(&self) -> u16 {
        self.next_packet_id
    }

    pub(crate) fn set_packet_id_counter(&mut self, value: u16) {
        self.next_packet_id = if value == 0 { 1 } else { value };
    }

    /// Record a subscription, replacing any previous one on the same filter
    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.topic_filter.clone(), subscription);
    }

    /// Remove a subscription; true if one existed
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Queue a message for delivery on reconnect
    ///
    /// At capacity the oldest queued message is dropped first; returns
    /// false when that happened.
    pub fn queue_message(&mut self, publish: Publish) -> bool {
        let mut kept_all = true;
        if self.queued_messages.len() >= self.max_queued_messages {
            self.queued_messages.pop_front();
            kept_all = false;
        }
        self.queued_messages.push_back(publish);
        kept_all
    }

    /// Take every queued message, oldest first
    pub fn drain_queued_messages(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.queued_messages)
    }

    /// Drop all state in one step: subscriptions, pending queues, will.
    /// Used by clean-start resume.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.pending_qos1.clear();
        self.pending_qos2.clear();
        self.pending_pubcomp.clear();
        self.pending_pubrel.clear();
        self.queued_messages.clear();
        self.will = None;
        self.will_delay_interval = 0;
    }

    /// Total outbound messages awaiting acknowledgement
    pub fn pending_count(&self) -> usize {
        self.pending_qos1.len() + self.pending_qos2.len() + self.pending_pubcomp.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("clean_start", &self.clean_start)
            .field("expiry_interval", &self.expiry_interval)
            .field("subscriptions", &self.subscriptions.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Arc::from("c1"), ProtocolVersion::V5)
    }

    #[test]
    fn packet_ids_skip_pending_and_wrap() {
        let mut s = session();
        assert_eq!(s.next_packet_id(), 1);
        assert_eq!(s.next_packet_id(), 2);

        // occupy 3 in each kind of container
        s.pending_qos1.insert(
            3,
            PendingMessage::new(
                3,
                Arc::from("t"),
                Bytes::new(),
                QoS::AtLeastOnce,
                false,
                Properties::default(),
            ),
        );
        s.pending_pubrel.insert(4);
        s.pending_pubcomp.insert(5);
        assert_eq!(s.next_packet_id(), 6);

        // wrap: counter jumps 65535 -> 1, never 0
        s.set_packet_id_counter(u16::MAX);
        assert_eq!(s.next_packet_id(), u16::MAX);
        assert_eq!(s.next_packet_id(), 1);
    }

    #[test]
    fn expiry_rules() {
        let mut s = session();
        let now = Instant::now();
        assert!(!s.is_expired(now));

        s.clean_start = false;
        s.expiry_interval = 0;
        s.set_disconnected();
        // persistent forever
        assert!(!s.is_expired(now + Duration::from_secs(86_400)));

        s.expiry_interval = EXPIRY_NEVER;
        assert!(!s.is_expired(now + Duration::from_secs(86_400)));

        s.expiry_interval = 10;
        let disconnected_at = s.disconnected_at.unwrap();
        assert!(!s.is_expired(disconnected_at + Duration::from_secs(10)));
        assert!(s.is_expired(disconnected_at + Duration::from_secs(11)));

        s.set_active();
        assert!(!s.is_expired(disconnected_at + Duration::from_secs(11)));

        s.set_expired();
        assert!(s.is_expired(now));
    }

    #[test]
    fn clear_empties_everything() {
        let mut s = session();
        s.will = Some(Will {
            topic: "w".into(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Properties::default(),
        });
        s.will_delay_interval = 5;
        s.pending_pubrel.insert(9);
        s.add_subscription(Subscription {
            client_id: s.client_id.clone(),
            topic_filter: "a/b".into(),
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: Default::default(),
            subscription_id: None,
            share_group: None,
        });

        s.queue_message(Publish::default());

        s.clear();
        assert!(s.will.is_none());
        assert_eq!(s.will_delay_interval, 0);
        assert!(s.subscriptions.is_empty());
        assert_eq!(s.pending_count(), 0);
        assert!(s.pending_pubrel.is_empty());
        assert!(s.queued_messages.is_empty());
    }

    #[test]
    fn offline_queue_drops_oldest_at_capacity() {
        let mut s = session();
        s.max_queued_messages = 2;

        let msg = |topic: &str| Publish {
            topic: Arc::from(topic),
            ..Default::default()
        };

        assert!(s.queue_message(msg("a")));
        assert!(s.queue_message(msg("b")));
        // capacity reached: "a" falls off the front
        assert!(!s.queue_message(msg("c")));

        let drained = s.drain_queued_messages();
        let topics: Vec<&str> = drained.iter().map(|p| p.topic.as_ref()).collect();
        assert_eq!(topics, vec!["b", "c"]);
        assert!(s.queued_messages.is_empty());
    }

    #[test]
    fn pending_message_expiry_and_attempts() {
        let mut props = Properties::default();
        props.message_expiry_interval = Some(1);
        let mut msg = PendingMessage::new(
            1,
            Arc::from("t"),
            Bytes::new(),
            QoS::AtLeastOnce,
            false,
            props,
        );

        let now = msg.created_at;
        assert!(!msg.is_expired(now));
        assert!(msg.is_expired(now + Duration::from_secs(1)));

        assert!(!msg.dup);
        msg.mark_attempt();
        assert!(msg.dup);
        assert_eq!(msg.attempt_count, 1);
    }
}
