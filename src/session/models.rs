//! Serializable session records
//!
//! Storage-friendly mirrors of the runtime session types, encoded with
//! bincode. Wall-clock seconds stand in for `Instant` on disk; the
//! conversion back is approximate, which is fine for expiry math.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, RetainHandling, Will};
use crate::router::Subscription;

use super::{PendingMessage, Session, SessionState};

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub protocol_version: u8,
    pub state: u8,
    pub clean_start: bool,
    pub expiry_interval: u32,
    pub created_at_secs: u64,
    pub last_accessed_at_secs: u64,
    pub disconnected_at_secs: Option<u64>,
    pub will: Option<StoredWill>,
    pub will_delay_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub pending_qos1: Vec<StoredPendingMessage>,
    pub pending_qos2: Vec<StoredPendingMessage>,
    pub pending_pubcomp: Vec<u16>,
    pub pending_pubrel: Vec<u16>,
    pub queued_messages: Vec<StoredPublish>,
    pub max_queued_messages: u64,
    pub next_packet_id: u16,
    pub max_packet_size: u32,
    pub receive_maximum: u16,
}

/// Persisted subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
    pub share_group: Option<String>,
}

/// Persisted publish queued for delivery on reconnect
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

/// Persisted pending outbound message
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredPendingMessage {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub properties: StoredProperties,
    pub created_at_secs: u64,
    pub attempt_count: u32,
    pub expiry_interval: u32,
}

/// Persisted will message
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// Persisted MQTT v5 properties (subset relevant for stored messages)
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn instant_to_unix_secs(instant: Instant) -> u64 {
    let now = Instant::now();
    let system_now = SystemTime::now();

    if instant <= now {
        let elapsed = now.duration_since(instant);
        system_now
            .checked_sub(elapsed)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    } else {
        now_unix_secs()
    }
}

fn unix_secs_to_instant(secs: u64) -> Instant {
    let now = Instant::now();
    let now_unix = now_unix_secs();

    if secs <= now_unix {
        let elapsed = Duration::from_secs(now_unix - secs);
        now.checked_sub(elapsed).unwrap_or(now)
    } else {
        now
    }
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(Bytes::from),
            user_properties: stored.user_properties,
            ..Default::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            dup: stored.dup,
            packet_id: stored.packet_id,
            properties: Properties::from(stored.properties),
        }
    }
}

impl From<&Will> for StoredWill {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            properties: StoredProperties::from(&will.properties),
        }
    }
}

impl From<StoredWill> for Will {
    fn from(stored: StoredWill) -> Self {
        Self {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            properties: Properties::from(stored.properties),
        }
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            filter: sub.topic_filter.clone(),
            qos: sub.qos as u8,
            no_local: sub.no_local,
            retain_as_published: sub.retain_as_published,
            retain_handling: sub.retain_handling as u8,
            subscription_id: sub.subscription_id,
            share_group: sub.share_group.as_ref().map(|g| g.to_string()),
        }
    }
}

impl StoredSubscription {
    fn into_subscription(self, client_id: &Arc<str>) -> Subscription {
        Subscription {
            client_id: client_id.clone(),
            topic_filter: self.filter,
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: RetainHandling::from_u8(self.retain_handling).unwrap_or_default(),
            subscription_id: self.subscription_id,
            share_group: self.share_group.map(Arc::from),
        }
    }
}

impl From<&PendingMessage> for StoredPendingMessage {
    fn from(pm: &PendingMessage) -> Self {
        Self {
            packet_id: pm.packet_id,
            topic: pm.topic.to_string(),
            payload: pm.payload.to_vec(),
            qos: pm.qos as u8,
            retain: pm.retain,
            dup: pm.dup,
            properties: StoredProperties::from(&pm.properties),
            created_at_secs: instant_to_unix_secs(pm.created_at),
            attempt_count: pm.attempt_count,
            expiry_interval: pm.expiry_interval,
        }
    }
}

impl From<StoredPendingMessage> for PendingMessage {
    fn from(stored: StoredPendingMessage) -> Self {
        let created_at = unix_secs_to_instant(stored.created_at_secs);
        Self {
            packet_id: stored.packet_id,
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            dup: stored.dup,
            properties: Properties::from(stored.properties),
            created_at,
            last_attempt_at: created_at,
            attempt_count: stored.attempt_count,
            expiry_interval: stored.expiry_interval,
        }
    }
}

impl StoredSession {
    /// Snapshot a runtime session into its persisted form
    pub fn from_session(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            protocol_version: session.protocol_version as u8,
            state: session.state as u8,
            clean_start: session.clean_start,
            expiry_interval: session.expiry_interval,
            created_at_secs: instant_to_unix_secs(session.created_at),
            last_accessed_at_secs: instant_to_unix_secs(session.last_accessed_at),
            disconnected_at_secs: session.disconnected_at.map(instant_to_unix_secs),
            will: session.will.as_ref().map(StoredWill::from),
            will_delay_interval: session.will_delay_interval,
            subscriptions: session
                .subscriptions
                .values()
                .map(StoredSubscription::from)
                .collect(),
            pending_qos1: session
                .pending_qos1
                .values()
                .map(StoredPendingMessage::from)
                .collect(),
            pending_qos2: session
                .pending_qos2
                .values()
                .map(StoredPendingMessage::from)
                .collect(),
            pending_pubcomp: session.pending_pubcomp.iter().copied().collect(),
            pending_pubrel: session.pending_pubrel.iter().copied().collect(),
            queued_messages: session
                .queued_messages
                .iter()
                .map(StoredPublish::from)
                .collect(),
            max_queued_messages: session.max_queued_messages as u64,
            next_packet_id: session.packet_id_counter(),
            max_packet_size: session.max_packet_size,
            receive_maximum: session.receive_maximum,
        }
    }

    /// Rebuild the runtime session
    pub fn into_session(self) -> Session {
        let client_id: Arc<str> = Arc::from(self.client_id);
        let mut session = Session::new(
            client_id.clone(),
            ProtocolVersion::from_u8(self.protocol_version).unwrap_or_default(),
        );

        session.state = SessionState::from_u8(self.state).unwrap_or(SessionState::Disconnected);
        session.clean_start = self.clean_start;
        session.expiry_interval = self.expiry_interval;
        session.created_at = unix_secs_to_instant(self.created_at_secs);
        session.last_accessed_at = unix_secs_to_instant(self.last_accessed_at_secs);
        session.disconnected_at = self.disconnected_at_secs.map(unix_secs_to_instant);
        session.will = self.will.map(Will::from);
        session.will_delay_interval = self.will_delay_interval;

        for stored in self.subscriptions {
            let sub = stored.into_subscription(&client_id);
            session.subscriptions.insert(sub.topic_filter.clone(), sub);
        }
        for stored in self.pending_qos1 {
            let pm = PendingMessage::from(stored);
            session.pending_qos1.insert(pm.packet_id, pm);
        }
        for stored in self.pending_qos2 {
            let pm = PendingMessage::from(stored);
            session.pending_qos2.insert(pm.packet_id, pm);
        }
        session.pending_pubcomp = self.pending_pubcomp.into_iter().collect();
        session.pending_pubrel = self.pending_pubrel.into_iter().collect();
        session.queued_messages = self.queued_messages.into_iter().map(Publish::from).collect();
        session.max_queued_messages = self.max_queued_messages as usize;
        session.set_packet_id_counter(self.next_packet_id);
        session.max_packet_size = self.max_packet_size;
        session.receive_maximum = self.receive_maximum;

        session
    }
}
