//! QoS delivery engine
//!
//! Inbound and outbound QoS 1/2 state machines with retry, inbound
//! deduplication, inflight accounting and packet-id allocation. The
//! engine talks to the packet encoder and to policy layers through a
//! [`QosHandler`] trait object; hot operations run under a single coarse
//! mutex and stay short.

mod dedup;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{Properties, Publish, QoS};
use crate::session::PendingMessage;

use dedup::{DedupCache, DEDUP_RETENTION};

/// QoS engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QosError {
    /// Operation on a closed engine
    HandlerClosed,
    /// Inflight cap reached
    QueueFull,
    /// The message's expiry interval already elapsed
    Expired,
    /// No pending entry with the given packet id
    PacketIdNotFound,
    /// QoS/packet shape mismatch (e.g. QoS > 0 without a packet id)
    InvalidQoS,
    /// A message exhausted its retransmission budget
    MaxRetriesExceeded,
}

impl fmt::Display for QosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerClosed => write!(f, "qos engine closed"),
            Self::QueueFull => write!(f, "inflight queue full"),
            Self::Expired => write!(f, "message expired"),
            Self::PacketIdNotFound => write!(f, "packet identifier not found"),
            Self::InvalidQoS => write!(f, "invalid qos for packet"),
            Self::MaxRetriesExceeded => write!(f, "max retries exceeded"),
        }
    }
}

impl std::error::Error for QosError {}

/// QoS engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Cap on outstanding outbound QoS > 0 messages
    pub max_inflight: usize,
    /// Base retransmission interval; also the retry sweep period
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Retransmission attempts before a message is given up
    pub max_retries: u32,
    /// Exponential backoff factor applied from the second retry on
    pub retry_backoff: f64,
    /// Ceiling for the backed-off retry interval
    #[serde(with = "humantime_serde")]
    pub max_retry_interval: Duration,
    /// Period of the cleanup sweep (dedup aging, stale PUBREL waits)
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// How long to wait for PUBCOMP before dropping a released QoS 2
    /// message (zero waits forever)
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Deduplicate inbound packet ids
    pub enable_dedup: bool,
    /// Cap on remembered inbound packet ids
    pub dedup_window_size: usize,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1024,
            retry_interval: Duration::from_secs(5),
            max_retries: 5,
            retry_backoff: 2.0,
            max_retry_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(300),
            enable_dedup: true,
            dedup_window_size: 4096,
        }
    }
}

/// The engine's interface to the packet encoder and policy layers
///
/// Every method has a default no-op. The acknowledgement callbacks carry
/// both directions of each flow: for outbound messages they report the
/// peer's acknowledgement; for inbound messages they ask the network
/// layer to emit the corresponding packet.
pub trait QosHandler: Send + Sync {
    /// Outbound: emit this PUBLISH to the peer. Inbound: deliver it to
    /// the application. Errors roll back (outbound) or suppress the
    /// acknowledgement (inbound).
    fn on_publish(&self, _publish: &Publish) -> Result<(), QosError> {
        Ok(())
    }

    /// Outbound QoS 1 completed / inbound QoS 1: emit PUBACK
    fn on_puback(&self, _packet_id: u16) {}

    /// Outbound QoS 2 first ack observed / inbound QoS 2: emit PUBREC
    fn on_pubrec(&self, _packet_id: u16) {}

    /// Outbound QoS 2: emit PUBREL / inbound QoS 2: release observed
    fn on_pubrel(&self, _packet_id: u16) {}

    /// Outbound QoS 2 completed / inbound QoS 2: emit PUBCOMP
    fn on_pubcomp(&self, _packet_id: u16) {}

    /// A pending message expired before acknowledgement
    fn on_expired(&self, _publish: &Publish) {}

    /// A pending message exhausted its retries
    fn on_max_retry(&self, _publish: &Publish) {}
}

/// Engine state behind the coarse mutex
struct QosState {
    /// Outbound QoS 1 awaiting PUBACK
    outbound_qos1: AHashMap<u16, PendingMessage>,
    /// Outbound QoS 2 awaiting PUBREC
    outbound_qos2: AHashMap<u16, PendingMessage>,
    /// Outbound QoS 2 released (PUBREL sent) awaiting PUBCOMP
    pending_pubrel: AHashMap<u16, Instant>,
    /// Inbound QoS 2 publish ids awaiting PUBREL
    inbound_received: AHashSet<u16>,
    dedup: DedupCache,
    next_packet_id: u16,
    inflight: usize,
}

impl QosState {
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id {
                u16::MAX => 1,
                n => n + 1,
            };

            if !self.outbound_qos1.contains_key(&id)
                && !self.outbound_qos2.contains_key(&id)
                && !self.pending_pubrel.contains_key(&id)
                && !self.inbound_received.contains(&id)
            {
                return id;
            }
        }
    }
}

/// Counters snapshot for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosStats {
    pub inflight: usize,
    pub pending_qos1: usize,
    pub pending_qos2: usize,
    pub pending_pubrel: usize,
    pub inbound_received: usize,
    pub dedup_entries: usize,
}

/// QoS 1/2 delivery engine
pub struct QosEngine {
    config: QosConfig,
    handler: Arc<dyn QosHandler>,
    state: Mutex<QosState>,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl QosEngine {
    /// Create an engine and start its retry and cleanup sweeps (requires
    /// a tokio runtime unless both intervals are zero).
    pub fn new(config: QosConfig, handler: Arc<dyn QosHandler>) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let dedup = DedupCache::new(config.dedup_window_size);

        let engine = Arc::new(Self {
            config,
            handler,
            state: Mutex::new(QosState {
                outbound_qos1: AHashMap::new(),
                outbound_qos2: AHashMap::new(),
                pending_pubrel: AHashMap::new(),
                inbound_received: AHashSet::new(),
                dedup,
                next_packet_id: 1,
                inflight: 0,
            }),
            closed: AtomicBool::new(false),
            shutdown,
        });

        if !engine.config.retry_interval.is_zero() {
            let retry = Arc::downgrade(&engine);
            let mut shutdown_rx = engine.shutdown.subscribe();
            let interval = engine.config.retry_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let Some(engine) = retry.upgrade() else { break };
                            engine.retry_sweep();
                        }
                    }
                }
            });
        }

        if !engine.config.cleanup_interval.is_zero() {
            let cleanup = Arc::downgrade(&engine);
            let mut shutdown_rx = engine.shutdown.subscribe();
            let interval = engine.config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let Some(engine) = cleanup.upgrade() else { break };
                            engine.cleanup_sweep();
                        }
                    }
                }
            });
        }

        engine
    }

    fn check_open(&self) -> Result<(), QosError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QosError::HandlerClosed)
        } else {
            Ok(())
        }
    }

    /// Start an outbound QoS 1 flow; returns the allocated packet id
    pub fn publish_qos1(
        &self,
        topic: Arc<str>,
        payload: Bytes,
        retain: bool,
        properties: Properties,
    ) -> Result<u16, QosError> {
        self.publish_outbound(topic, payload, QoS::AtLeastOnce, retain, properties)
    }

    /// Start an outbound QoS 2 flow; returns the allocated packet id
    pub fn publish_qos2(
        &self,
        topic: Arc<str>,
        payload: Bytes,
        retain: bool,
        properties: Properties,
    ) -> Result<u16, QosError> {
        self.publish_outbound(topic, payload, QoS::ExactlyOnce, retain, properties)
    }

    fn publish_outbound(
        &self,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Result<u16, QosError> {
        self.check_open()?;

        let (publish, packet_id) = {
            let mut state = self.state.lock();
            if state.inflight >= self.config.max_inflight {
                return Err(QosError::QueueFull);
            }

            let packet_id = state.allocate_packet_id();
            let message =
                PendingMessage::new(packet_id, topic, payload, qos, retain, properties);
            if message.is_expired(Instant::now()) {
                return Err(QosError::Expired);
            }

            let publish = message.to_publish();
            match qos {
                QoS::AtLeastOnce => state.outbound_qos1.insert(packet_id, message),
                QoS::ExactlyOnce => state.outbound_qos2.insert(packet_id, message),
                QoS::AtMostOnce => return Err(QosError::InvalidQoS),
            };
            state.inflight += 1;
            (publish, packet_id)
        };

        if let Err(e) = self.handler.on_publish(&publish) {
            // Roll back the insertion so the id frees up immediately
            let mut state = self.state.lock();
            if state.outbound_qos1.remove(&packet_id).is_some()
                || state.outbound_qos2.remove(&packet_id).is_some()
            {
                state.inflight -= 1;
            }
            return Err(e);
        }
        Ok(packet_id)
    }

    /// Peer acknowledged an outbound QoS 1 message
    pub fn handle_puback(&self, packet_id: u16) -> Result<(), QosError> {
        self.check_open()?;

        {
            let mut state = self.state.lock();
            if state.outbound_qos1.remove(&packet_id).is_none() {
                return Err(QosError::PacketIdNotFound);
            }
            state.inflight -= 1;
        }
        self.handler.on_puback(packet_id);
        Ok(())
    }

    /// Peer received an outbound QoS 2 message; emit PUBREL
    pub fn handle_pubrec(&self, packet_id: u16) -> Result<(), QosError> {
        self.check_open()?;

        {
            let mut state = self.state.lock();
            if state.outbound_qos2.remove(&packet_id).is_none() {
                return Err(QosError::PacketIdNotFound);
            }
            state.pending_pubrel.insert(packet_id, Instant::now());
        }
        self.handler.on_pubrec(packet_id);
        self.handler.on_pubrel(packet_id);
        Ok(())
    }

    /// Peer completed an outbound QoS 2 flow
    pub fn handle_pubcomp(&self, packet_id: u16) -> Result<(), QosError> {
        self.check_open()?;

        {
            let mut state = self.state.lock();
            if state.pending_pubrel.remove(&packet_id).is_none() {
                return Err(QosError::PacketIdNotFound);
            }
            state.inflight -= 1;
        }
        self.handler.on_pubcomp(packet_id);
        Ok(())
    }

    /// Process an inbound PUBLISH at any QoS
    ///
    /// A Message Expiry Interval of zero (or absent) means the message
    /// never expires; a just-received publish has no elapsed time to
    /// measure a positive interval against, so nothing is rejected here.
    pub fn handle_publish(&self, publish: &Publish) -> Result<(), QosError> {
        self.check_open()?;

        match publish.qos {
            QoS::AtMostOnce => self.handler.on_publish(publish),
            QoS::AtLeastOnce => self.handle_publish_qos1(publish),
            QoS::ExactlyOnce => self.handle_publish_qos2(publish),
        }
    }

    fn handle_publish_qos1(&self, publish: &Publish) -> Result<(), QosError> {
        let packet_id = publish.packet_id.ok_or(QosError::InvalidQoS)?;

        let duplicate = {
            let mut state = self.state.lock();
            if self.config.enable_dedup && state.dedup.contains(packet_id) {
                true
            } else {
                if self.config.enable_dedup {
                    state.dedup.insert(packet_id);
                }
                false
            }
        };

        if duplicate {
            // Acknowledge again without re-delivering to the application
            self.handler.on_puback(packet_id);
            return Ok(());
        }

        self.handler.on_publish(publish)?;
        self.handler.on_puback(packet_id);
        Ok(())
    }

    fn handle_publish_qos2(&self, publish: &Publish) -> Result<(), QosError> {
        let packet_id = publish.packet_id.ok_or(QosError::InvalidQoS)?;

        let retransmission = {
            let mut state = self.state.lock();
            if state.inbound_received.contains(&packet_id)
                || (self.config.enable_dedup && state.dedup.contains(packet_id))
            {
                true
            } else {
                state.inbound_received.insert(packet_id);
                if self.config.enable_dedup {
                    state.dedup.insert(packet_id);
                }
                false
            }
        };

        if retransmission {
            // Safe retransmission path: just re-emit PUBREC
            self.handler.on_pubrec(packet_id);
            return Ok(());
        }

        self.handler.on_publish(publish)?;
        self.handler.on_pubrec(packet_id);
        Ok(())
    }

    /// Peer released an inbound QoS 2 publish
    ///
    /// A PUBREL for an unknown id still gets a PUBCOMP: the peer may be
    /// retrying after our earlier PUBCOMP was lost.
    pub fn handle_pubrel(&self, packet_id: u16) -> Result<(), QosError> {
        self.check_open()?;

        let known = {
            let mut state = self.state.lock();
            state.inbound_received.remove(&packet_id)
        };

        if known {
            self.handler.on_pubrel(packet_id);
        }
        self.handler.on_pubcomp(packet_id);
        Ok(())
    }

    /// Retry interval for a message on its `attempt_count`-th attempt
    ///
    /// The first and second sends both wait the base interval; backoff
    /// kicks in from the second retry, capped at `max_retry_interval`.
    fn retry_interval_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let factor = self.config.retry_backoff.powi(exponent as i32);
        let scaled = self.config.retry_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.config.max_retry_interval.as_secs_f64()))
    }

    /// One pass of the retry loop over both outbound maps
    pub fn retry_sweep(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut expired: Vec<Publish> = Vec::new();
        let mut exhausted: Vec<Publish> = Vec::new();
        let mut resend: Vec<Publish> = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let max_retries = self.config.max_retries;

            let mut dropped = 0usize;
            for map in [&mut state.outbound_qos1, &mut state.outbound_qos2] {
                map.retain(|_, message| {
                    if message.is_expired(now) {
                        expired.push(message.to_publish());
                        dropped += 1;
                        return false;
                    }

                    let due = now.duration_since(message.last_attempt_at)
                        >= self.retry_interval_for(message.attempt_count);
                    if !due {
                        return true;
                    }

                    if message.attempt_count >= max_retries {
                        exhausted.push(message.to_publish());
                        dropped += 1;
                        return false;
                    }

                    message.mark_attempt();
                    resend.push(message.to_publish());
                    true
                });
            }
            state.inflight -= dropped;
        }

        for publish in &expired {
            debug!(packet_id = ?publish.packet_id, "Pending message expired");
            self.handler.on_expired(publish);
        }
        for publish in &exhausted {
            warn!(packet_id = ?publish.packet_id, "Max retries exceeded");
            self.handler.on_max_retry(publish);
        }
        for publish in &resend {
            if let Err(e) = self.handler.on_publish(publish) {
                warn!(packet_id = ?publish.packet_id, "Retransmission failed: {}", e);
            }
        }
    }

    /// One pass of the cleanup loop: dedup aging and stale PUBREL waits
    pub fn cleanup_sweep(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        let aged_out = state.dedup.cleanup(DEDUP_RETENTION);
        if aged_out > 0 {
            debug!("Dropped {} aged dedup entries", aged_out);
        }

        if !self.config.ack_timeout.is_zero() {
            let deadline = self.config.ack_timeout;
            let before = state.pending_pubrel.len();
            state
                .pending_pubrel
                .retain(|_, released_at| now.duration_since(*released_at) < deadline);
            let dropped = before - state.pending_pubrel.len();
            if dropped > 0 {
                state.inflight -= dropped;
                warn!("Dropped {} QoS 2 flows awaiting PUBCOMP", dropped);
            }
        }
    }

    /// Current counters; `inflight` equals the sum of the three outbound
    /// containers. Still available after close.
    pub fn stats(&self) -> QosStats {
        let state = self.state.lock();
        QosStats {
            inflight: state.inflight,
            pending_qos1: state.outbound_qos1.len(),
            pending_qos2: state.outbound_qos2.len(),
            pending_pubrel: state.pending_pubrel.len(),
            inbound_received: state.inbound_received.len(),
            dedup_entries: state.dedup.len(),
        }
    }

    /// Outstanding outbound QoS > 0 messages; available after close
    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    /// Stop the sweeps and reject further operations; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for QosEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        published: PlMutex<Vec<Publish>>,
        pubacks: PlMutex<Vec<u16>>,
        pubrecs: PlMutex<Vec<u16>>,
        pubrels: PlMutex<Vec<u16>>,
        pubcomps: PlMutex<Vec<u16>>,
        expired: PlMutex<Vec<u16>>,
        max_retry: PlMutex<Vec<u16>>,
        fail_publish: AtomicBool,
    }

    impl QosHandler for Recorder {
        fn on_publish(&self, publish: &Publish) -> Result<(), QosError> {
            if self.fail_publish.load(Ordering::Relaxed) {
                return Err(QosError::HandlerClosed);
            }
            self.published.lock().push(publish.clone());
            Ok(())
        }
        fn on_puback(&self, id: u16) {
            self.pubacks.lock().push(id);
        }
        fn on_pubrec(&self, id: u16) {
            self.pubrecs.lock().push(id);
        }
        fn on_pubrel(&self, id: u16) {
            self.pubrels.lock().push(id);
        }
        fn on_pubcomp(&self, id: u16) {
            self.pubcomps.lock().push(id);
        }
        fn on_expired(&self, publish: &Publish) {
            self.expired.lock().push(publish.packet_id.unwrap_or(0));
        }
        fn on_max_retry(&self, publish: &Publish) {
            self.max_retry.lock().push(publish.packet_id.unwrap_or(0));
        }
    }

    fn engine_with(config: QosConfig) -> (Arc<QosEngine>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = QosEngine::new(config, recorder.clone());
        (engine, recorder)
    }

    fn quiet_config() -> QosConfig {
        QosConfig {
            retry_interval: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn inbound(id: u16, qos: QoS) -> Publish {
        Publish {
            qos,
            topic: Arc::from("t"),
            packet_id: Some(id),
            payload: Bytes::from_static(b"p"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn qos1_outbound_completes() {
        let (engine, recorder) = engine_with(quiet_config());

        let id = engine
            .publish_qos1(Arc::from("a/b"), Bytes::from_static(&[0x01, 0x02]), false, Properties::default())
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(engine.inflight(), 1);
        assert_eq!(engine.stats().pending_qos1, 1);
        assert_eq!(recorder.published.lock().len(), 1);

        engine.handle_puback(1).unwrap();
        assert_eq!(engine.inflight(), 0);
        assert_eq!(engine.stats().pending_qos1, 0);
        assert_eq!(recorder.pubacks.lock().as_slice(), &[1]);

        // acknowledging again is an error, not a corruption
        assert_eq!(engine.handle_puback(1), Err(QosError::PacketIdNotFound));
        assert_eq!(engine.inflight(), 0);
    }

    #[tokio::test]
    async fn qos2_outbound_full_roundtrip() {
        let (engine, recorder) = engine_with(quiet_config());

        let id = engine
            .publish_qos2(Arc::from("t"), Bytes::from_static(b"x"), false, Properties::default())
            .unwrap();
        assert_eq!(id, 1);

        engine.handle_pubrec(id).unwrap();
        assert_eq!(recorder.pubrecs.lock().as_slice(), &[1]);
        assert_eq!(recorder.pubrels.lock().as_slice(), &[1]);
        assert_eq!(engine.stats().pending_pubrel, 1);
        // still inflight until PUBCOMP
        assert_eq!(engine.inflight(), 1);

        // PUBACK for a QoS 2 id is impossible by construction
        assert_eq!(engine.handle_puback(id), Err(QosError::PacketIdNotFound));

        engine.handle_pubcomp(id).unwrap();
        assert_eq!(recorder.pubcomps.lock().as_slice(), &[1]);
        assert_eq!(engine.inflight(), 0);

        assert_eq!(engine.handle_pubcomp(id), Err(QosError::PacketIdNotFound));
    }

    #[tokio::test]
    async fn publish_rolls_back_when_handler_fails() {
        let (engine, recorder) = engine_with(quiet_config());
        recorder.fail_publish.store(true, Ordering::Relaxed);

        let result = engine.publish_qos1(
            Arc::from("t"),
            Bytes::new(),
            false,
            Properties::default(),
        );
        assert!(result.is_err());
        assert_eq!(engine.inflight(), 0);
        assert_eq!(engine.stats().pending_qos1, 0);

        // rollback left no pending entry; the next publish succeeds
        recorder.fail_publish.store(false, Ordering::Relaxed);
        let id = engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn inflight_cap_enforced() {
        let (engine, _) = engine_with(QosConfig {
            max_inflight: 2,
            ..quiet_config()
        });

        engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        engine
            .publish_qos2(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        assert_eq!(
            engine.publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default()),
            Err(QosError::QueueFull)
        );
    }

    #[tokio::test]
    async fn inbound_qos1_dedup_acks_without_redelivery() {
        let (engine, recorder) = engine_with(quiet_config());

        let publish = inbound(42, QoS::AtLeastOnce);
        engine.handle_publish(&publish).unwrap();
        engine.handle_publish(&publish).unwrap();
        engine.handle_publish(&publish).unwrap();

        assert_eq!(recorder.published.lock().len(), 1);
        assert_eq!(recorder.pubacks.lock().len(), 3);
    }

    #[tokio::test]
    async fn inbound_qos1_without_dedup_redelivers() {
        let (engine, recorder) = engine_with(QosConfig {
            enable_dedup: false,
            ..quiet_config()
        });

        let publish = inbound(42, QoS::AtLeastOnce);
        engine.handle_publish(&publish).unwrap();
        engine.handle_publish(&publish).unwrap();

        assert_eq!(recorder.published.lock().len(), 2);
        assert_eq!(recorder.pubacks.lock().len(), 2);
    }

    #[tokio::test]
    async fn inbound_qos2_retransmissions_deliver_once() {
        let (engine, recorder) = engine_with(quiet_config());

        let publish = inbound(42, QoS::ExactlyOnce);
        for _ in 0..3 {
            engine.handle_publish(&publish).unwrap();
        }
        assert_eq!(recorder.published.lock().len(), 1);
        assert!(recorder.pubrecs.lock().len() >= 3);

        engine.handle_pubrel(42).unwrap();
        engine.handle_pubrel(42).unwrap();
        assert_eq!(recorder.pubrels.lock().len(), 1);
        assert!(recorder.pubcomps.lock().len() >= 2);
    }

    #[tokio::test]
    async fn inbound_qos0_passes_through() {
        let (engine, recorder) = engine_with(quiet_config());
        let publish = Publish {
            topic: Arc::from("t"),
            payload: Bytes::from_static(b"p"),
            ..Default::default()
        };
        engine.handle_publish(&publish).unwrap();
        engine.handle_publish(&publish).unwrap();
        assert_eq!(recorder.published.lock().len(), 2);
    }

    #[tokio::test]
    async fn zero_expiry_interval_never_expires_inbound() {
        let (engine, recorder) = engine_with(quiet_config());

        // QoS 0 always reaches the application
        let mut qos0 = Publish {
            topic: Arc::from("t"),
            payload: Bytes::from_static(b"p"),
            ..Default::default()
        };
        qos0.properties.message_expiry_interval = Some(0);
        engine.handle_publish(&qos0).unwrap();
        assert_eq!(recorder.published.lock().len(), 1);

        // QoS 1 is delivered and acknowledged
        let mut qos1 = inbound(9, QoS::AtLeastOnce);
        qos1.properties.message_expiry_interval = Some(0);
        engine.handle_publish(&qos1).unwrap();
        assert_eq!(recorder.published.lock().len(), 2);
        assert_eq!(recorder.pubacks.lock().as_slice(), &[9]);

        // QoS 2 runs the full exactly-once handshake
        let mut qos2 = inbound(10, QoS::ExactlyOnce);
        qos2.properties.message_expiry_interval = Some(0);
        engine.handle_publish(&qos2).unwrap();
        assert_eq!(recorder.published.lock().len(), 3);
        assert_eq!(recorder.pubrecs.lock().as_slice(), &[10]);

        engine.handle_pubrel(10).unwrap();
        assert_eq!(recorder.pubrels.lock().as_slice(), &[10]);
        assert_eq!(recorder.pubcomps.lock().as_slice(), &[10]);
    }

    #[tokio::test]
    async fn packet_ids_skip_all_containers_and_wrap() {
        let (engine, _) = engine_with(quiet_config());

        {
            let mut state = engine.state.lock();
            state.next_packet_id = u16::MAX;
            state.inbound_received.insert(1);
            state.pending_pubrel.insert(2, Instant::now());
        }

        let id = engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        assert_eq!(id, u16::MAX);

        // wraps past 0, skips 1 (inbound) and 2 (pubrel)
        let id = engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn retry_backoff_schedule() {
        let (engine, _) = engine_with(QosConfig {
            retry_interval: Duration::from_secs(10),
            retry_backoff: 2.0,
            max_retry_interval: Duration::from_secs(60),
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        });

        // attempts 0 and 1 both wait the base interval
        assert_eq!(engine.retry_interval_for(0), Duration::from_secs(10));
        assert_eq!(engine.retry_interval_for(1), Duration::from_secs(10));
        assert_eq!(engine.retry_interval_for(2), Duration::from_secs(20));
        assert_eq!(engine.retry_interval_for(3), Duration::from_secs(40));
        // capped
        assert_eq!(engine.retry_interval_for(4), Duration::from_secs(60));
        assert_eq!(engine.retry_interval_for(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retry_sweep_marks_dup_and_resends() {
        let (engine, recorder) = engine_with(QosConfig {
            retry_interval: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            max_retries: 2,
            ..Default::default()
        });

        let id = engine
            .publish_qos1(Arc::from("t"), Bytes::from_static(b"r"), false, Properties::default())
            .unwrap();
        assert!(!recorder.published.lock()[0].dup);

        // interval zero means every pending message is due immediately
        engine.retry_sweep();
        {
            let published = recorder.published.lock();
            assert_eq!(published.len(), 2);
            assert!(published[1].dup);
        }

        engine.retry_sweep();
        assert_eq!(recorder.published.lock().len(), 3);

        // third sweep: attempt_count reached max_retries, message dropped
        engine.retry_sweep();
        assert_eq!(recorder.max_retry.lock().as_slice(), &[id]);
        assert_eq!(engine.inflight(), 0);
    }

    #[tokio::test]
    async fn retry_sweep_expires_messages() {
        let (engine, recorder) = engine_with(quiet_config());

        let mut properties = Properties::default();
        properties.message_expiry_interval = Some(1);
        let id = engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, properties)
            .unwrap();

        {
            let mut state = engine.state.lock();
            let message = state.outbound_qos1.get_mut(&id).unwrap();
            message.created_at = Instant::now() - Duration::from_secs(2);
        }

        engine.retry_sweep();
        assert_eq!(recorder.expired.lock().as_slice(), &[id]);
        assert_eq!(engine.inflight(), 0);
    }

    #[tokio::test]
    async fn cleanup_drops_stale_pubrel_waits() {
        let (engine, _) = engine_with(QosConfig {
            ack_timeout: Duration::from_millis(10),
            ..quiet_config()
        });

        let id = engine
            .publish_qos2(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();
        engine.handle_pubrec(id).unwrap();
        assert_eq!(engine.inflight(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.cleanup_sweep();
        assert_eq!(engine.inflight(), 0);
        assert_eq!(engine.stats().pending_pubrel, 0);
    }

    #[tokio::test]
    async fn close_rejects_operations_but_keeps_counts() {
        let (engine, _) = engine_with(quiet_config());
        engine
            .publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default())
            .unwrap();

        engine.close();
        engine.close();

        assert_eq!(
            engine.publish_qos1(Arc::from("t"), Bytes::new(), false, Properties::default()),
            Err(QosError::HandlerClosed)
        );
        assert_eq!(engine.handle_puback(1), Err(QosError::HandlerClosed));
        assert_eq!(
            engine.handle_publish(&inbound(5, QoS::AtLeastOnce)),
            Err(QosError::HandlerClosed)
        );
        // counts stay readable
        assert_eq!(engine.inflight(), 1);
        assert_eq!(engine.stats().pending_qos1, 1);
    }
}
