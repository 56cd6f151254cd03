//! Session manager
//!
//! Creates, resumes and expires sessions. Owns the active-session cache
//! for hot-path lookups, the pluggable [`SessionStore`] for persistence,
//! and the [`WillPublisher`] through which will messages leave the
//! session layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolVersion, Will};

use super::store::SessionStore;
use super::{Session, SessionError, SessionState};

/// Where will messages go when a session has to publish one
#[async_trait]
pub trait WillPublisher: Send + Sync {
    /// Publish the will on behalf of `client_id`
    async fn publish_will(&self, client_id: &str, will: Will);
}

/// A will publisher that drops everything; useful for embedding and tests
pub struct NoopWillPublisher;

#[async_trait]
impl WillPublisher for NoopWillPublisher {
    async fn publish_will(&self, _client_id: &str, _will: Will) {}
}

/// Expiry checker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// How often the expiry checker scans the store (zero disables it)
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Prefix for server-assigned client identifiers
    pub assigned_id_prefix: String,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: Duration::from_secs(30),
            assigned_id_prefix: "auto-".to_string(),
        }
    }
}

/// Session creation, resumption, takeover and expiry
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    will_publisher: Arc<dyn WillPublisher>,
    /// Sessions currently attached to a live connection
    active: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    config: ExpiryConfig,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Create a manager and start its expiry checker (when the configured
    /// interval is non-zero; requires a tokio runtime in that case).
    pub fn new(
        store: Arc<dyn SessionStore>,
        will_publisher: Arc<dyn WillPublisher>,
        config: ExpiryConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            store,
            will_publisher,
            active: DashMap::new(),
            config,
            shutdown,
            closed: AtomicBool::new(false),
        });

        if !manager.config.expiry_check_interval.is_zero() {
            let checker = Arc::downgrade(&manager);
            let mut shutdown_rx = manager.shutdown.subscribe();
            let interval = manager.config.expiry_check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let Some(manager) = checker.upgrade() else { break };
                            manager.check_expired().await;
                        }
                    }
                }
            });
        }

        manager
    }

    /// Handle a CONNECT: resume, clean-start or create the session.
    ///
    /// Returns the session and the `session_present` flag for CONNACK.
    pub async fn create(
        &self,
        client_id: &str,
        clean_start: bool,
        expiry_interval: u32,
        protocol_version: ProtocolVersion,
    ) -> Result<(Arc<RwLock<Session>>, bool), SessionError> {
        let now = Instant::now();

        // Active cache first, then the store
        let existing = match self.active.get(client_id) {
            Some(entry) => Some(entry.value().clone()),
            None => self
                .store
                .load(client_id)
                .await?
                .map(|s| Arc::new(RwLock::new(s))),
        };

        if let Some(session) = existing {
            let resumable = !session.read().is_expired(now);
            if resumable {
                let session_present = {
                    let mut s = session.write();
                    if clean_start {
                        s.clear();
                        s.clean_start = true;
                        s.expiry_interval = expiry_interval;
                        s.protocol_version = protocol_version;
                        s.set_active();
                        false
                    } else {
                        s.clean_start = false;
                        s.expiry_interval = expiry_interval;
                        s.protocol_version = protocol_version;
                        s.set_active();
                        true
                    }
                };

                let snapshot = session.read().clone();
                self.store.save(&snapshot).await?;
                self.active.insert(snapshot.client_id, session.clone());
                return Ok((session, session_present));
            }
        }

        // Fresh session
        let id: Arc<str> = Arc::from(client_id);
        let mut session = Session::new(id.clone(), protocol_version);
        session.clean_start = clean_start;
        session.expiry_interval = expiry_interval;
        session.set_active();

        let session = Arc::new(RwLock::new(session));
        let snapshot = session.read().clone();
        self.store.save(&snapshot).await?;
        self.active.insert(id, session.clone());
        Ok((session, false))
    }

    /// Look up a session: active cache first, then the store
    pub async fn get(&self, client_id: &str) -> Result<Arc<RwLock<Session>>, SessionError> {
        if let Some(entry) = self.active.get(client_id) {
            return Ok(entry.value().clone());
        }
        match self.store.load(client_id).await? {
            Some(session) => Ok(Arc::new(RwLock::new(session))),
            None => Err(SessionError::NotFound),
        }
    }

    /// Handle a client disconnect
    ///
    /// `send_will=false` (a clean DISCONNECT) drops the will entirely. A
    /// will with zero delay fires immediately; a delayed will is left for
    /// the expiry checker. Unknown clients are a no-op.
    pub async fn disconnect(&self, client_id: &str, send_will: bool) -> Result<(), SessionError> {
        let session = match self.active.get(client_id).map(|e| e.value().clone()) {
            Some(s) => s,
            None => match self.store.load(client_id).await? {
                Some(s) => Arc::new(RwLock::new(s)),
                None => {
                    debug!(client_id, "Disconnect for unknown session");
                    return Ok(());
                }
            },
        };

        let (will_to_publish, clean_start, expiry_interval) = {
            let mut s = session.write();
            s.set_disconnected();

            let will_to_publish = if send_will {
                if s.will_delay_interval == 0 {
                    s.will.take()
                } else {
                    // Delayed will stays attached for the expiry checker
                    None
                }
            } else {
                s.will = None;
                None
            };

            (will_to_publish, s.clean_start, s.expiry_interval)
        };

        if let Some(will) = will_to_publish {
            self.will_publisher.publish_will(client_id, will).await;
        }

        self.active.remove(client_id);

        if clean_start || expiry_interval == 0 {
            self.store.delete(client_id).await?;
        } else {
            let snapshot = session.read().clone();
            self.store.save(&snapshot).await?;
        }
        Ok(())
    }

    /// A new CONNECT is taking over this client id: the previous client's
    /// will is suppressed. No-op when there is no such session.
    pub async fn takeover(&self, client_id: &str) -> Result<(), SessionError> {
        if let Some(session) = self.active.get(client_id).map(|e| e.value().clone()) {
            let snapshot = {
                let mut s = session.write();
                s.will = None;
                s.clone()
            };
            self.store.save(&snapshot).await?;
            return Ok(());
        }

        if let Some(mut session) = self.store.load(client_id).await? {
            if session.will.take().is_some() {
                self.store.save(&session).await?;
            }
        }
        Ok(())
    }

    /// Remove a session everywhere
    pub async fn remove(&self, client_id: &str) -> Result<(), SessionError> {
        self.active.remove(client_id);
        self.store.delete(client_id).await?;
        Ok(())
    }

    /// Generate a server-assigned client identifier
    ///
    /// `{prefix}` followed by 32 hex characters of OS randomness. Retries
    /// up to 10 times on collision before giving up; in practice the
    /// first attempt wins.
    pub async fn generate_client_id(&self) -> Result<String, SessionError> {
        for _ in 0..10 {
            let mut entropy = [0u8; 16];
            OsRng.fill_bytes(&mut entropy);
            let mut id =
                String::with_capacity(self.config.assigned_id_prefix.len() + entropy.len() * 2);
            id.push_str(&self.config.assigned_id_prefix);
            for byte in entropy {
                use std::fmt::Write;
                let _ = write!(id, "{:02x}", byte);
            }

            if !self.active.contains_key(id.as_str()) && !self.store.exists(&id).await? {
                return Ok(id);
            }
        }
        Err(SessionError::AlreadyExists)
    }

    /// Number of sessions attached to live connections
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Stop the expiry checker and close the store; idempotent
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(());
        self.store.close().await?;
        Ok(())
    }

    /// One pass of the expiry checker
    ///
    /// Expired sessions fire any still-due will and are deleted; live
    /// disconnected sessions whose will delay has elapsed fire the will
    /// and keep the rest of their state. Per-session failures are logged
    /// and skipped.
    pub async fn check_expired(&self) {
        let ids = match self.store.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Expiry checker could not list sessions: {}", e);
                return;
            }
        };

        let now = Instant::now();
        for client_id in ids {
            if let Err(e) = self.check_one(&client_id, now).await {
                warn!(client_id = %client_id, "Expiry check failed: {}", e);
            }
        }
    }

    async fn check_one(&self, client_id: &str, now: Instant) -> Result<(), SessionError> {
        let Some(mut session) = self.store.load(client_id).await? else {
            return Ok(());
        };

        if session.is_expired(now) {
            if let Some(will) = session.will.take() {
                if Self::will_due(&session, now) {
                    self.will_publisher.publish_will(client_id, will).await;
                }
            }
            session.set_expired();
            self.active.remove(client_id);
            self.store.delete(client_id).await?;
            info!(client_id, "Session expired");
            return Ok(());
        }

        if session.state == SessionState::Disconnected
            && session.will.is_some()
            && Self::will_due(&session, now)
        {
            if let Some(will) = session.will.take() {
                self.will_publisher.publish_will(client_id, will).await;
            }
            self.store.save(&session).await?;
            debug!(client_id, "Delayed will published");
        }

        Ok(())
    }

    /// Whether a disconnected session's will delay has elapsed
    fn will_due(session: &Session, now: Instant) -> bool {
        if session.state != SessionState::Disconnected {
            return false;
        }
        match session.disconnected_at {
            Some(at) => {
                now.duration_since(at)
                    >= Duration::from_secs(session.will_delay_interval as u64)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Properties, QoS};
    use crate::session::MemorySessionStore;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct RecordingWillPublisher {
        published: Mutex<Vec<(String, Will)>>,
    }

    impl RecordingWillPublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.published.lock().len()
        }
    }

    #[async_trait]
    impl WillPublisher for RecordingWillPublisher {
        async fn publish_will(&self, client_id: &str, will: Will) {
            self.published.lock().push((client_id.to_string(), will));
        }
    }

    fn will() -> Will {
        Will {
            topic: "status/gone".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Properties::default(),
        }
    }

    fn manager_with(
        publisher: Arc<dyn WillPublisher>,
        interval: Duration,
    ) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            publisher,
            ExpiryConfig {
                expiry_check_interval: interval,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn create_resume_clean_start() {
        let manager = manager_with(Arc::new(NoopWillPublisher), Duration::ZERO);

        let (session, present) = manager
            .create("c1", false, 3600, ProtocolVersion::V5)
            .await
            .unwrap();
        assert!(!present);
        session.write().pending_pubrel.insert(42);

        manager.disconnect("c1", false).await.unwrap();
        assert_eq!(manager.active_count(), 0);

        // resume keeps state
        let (session, present) = manager
            .create("c1", false, 3600, ProtocolVersion::V5)
            .await
            .unwrap();
        assert!(present);
        assert!(session.read().pending_pubrel.contains(&42));

        // clean start clears it
        let (session, present) = manager
            .create("c1", true, 0, ProtocolVersion::V5)
            .await
            .unwrap();
        assert!(!present);
        assert!(session.read().pending_pubrel.is_empty());
    }

    #[tokio::test]
    async fn clean_start_session_deleted_on_disconnect() {
        let manager = manager_with(Arc::new(NoopWillPublisher), Duration::ZERO);
        manager
            .create("c1", true, 0, ProtocolVersion::V5)
            .await
            .unwrap();
        manager.disconnect("c1", false).await.unwrap();

        assert!(matches!(
            manager.get("c1").await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn immediate_will_fires_once() {
        let publisher = RecordingWillPublisher::new();
        let manager = manager_with(publisher.clone(), Duration::ZERO);

        let (session, _) = manager
            .create("c1", false, 60, ProtocolVersion::V5)
            .await
            .unwrap();
        session.write().will = Some(will());

        manager.disconnect("c1", true).await.unwrap();
        assert_eq!(publisher.count(), 1);

        // will is gone from the stored session
        let restored = manager.get("c1").await.unwrap();
        assert!(restored.read().will.is_none());
    }

    #[tokio::test]
    async fn clean_disconnect_suppresses_will() {
        let publisher = RecordingWillPublisher::new();
        let manager = manager_with(publisher.clone(), Duration::ZERO);

        let (session, _) = manager
            .create("c1", false, 60, ProtocolVersion::V5)
            .await
            .unwrap();
        session.write().will = Some(will());

        manager.disconnect("c1", false).await.unwrap();
        assert_eq!(publisher.count(), 0);
        assert!(manager.get("c1").await.unwrap().read().will.is_none());
    }

    #[tokio::test]
    async fn delayed_will_waits_for_checker() {
        let publisher = RecordingWillPublisher::new();
        let manager = manager_with(publisher.clone(), Duration::ZERO);

        let (session, _) = manager
            .create("c1", false, 600, ProtocolVersion::V5)
            .await
            .unwrap();
        {
            let mut s = session.write();
            s.will = Some(will());
            s.will_delay_interval = 0;
        }
        // delay of zero fires at disconnect, delay > 0 stays attached
        {
            session.write().will_delay_interval = 1;
        }
        manager.disconnect("c1", true).await.unwrap();
        assert_eq!(publisher.count(), 0);

        // not yet due
        manager.check_expired().await;
        assert_eq!(publisher.count(), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        manager.check_expired().await;
        assert_eq!(publisher.count(), 1);

        // will cleared, session still resumable
        let (_, present) = manager
            .create("c1", false, 600, ProtocolVersion::V5)
            .await
            .unwrap();
        assert!(present);
    }

    #[tokio::test]
    async fn expiry_checker_deletes_expired_sessions() {
        let publisher = RecordingWillPublisher::new();
        let manager = manager_with(publisher.clone(), Duration::ZERO);

        let (session, _) = manager
            .create("c1", false, 1, ProtocolVersion::V5)
            .await
            .unwrap();
        session.write().will = Some(will());
        {
            session.write().will_delay_interval = 0;
        }
        manager.disconnect("c1", true).await.unwrap();
        // zero-delay will already fired at disconnect
        assert_eq!(publisher.count(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        manager.check_expired().await;

        assert!(matches!(
            manager.get("c1").await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn takeover_clears_will() {
        let manager = manager_with(Arc::new(NoopWillPublisher), Duration::ZERO);

        let (session, _) = manager
            .create("c1", false, 60, ProtocolVersion::V5)
            .await
            .unwrap();
        session.write().will = Some(will());

        manager.takeover("c1").await.unwrap();
        assert!(session.read().will.is_none());

        // takeover of unknown client is a no-op
        manager.takeover("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn generated_ids_have_prefix_and_entropy() {
        let manager = manager_with(Arc::new(NoopWillPublisher), Duration::ZERO);

        let a = manager.generate_client_id().await.unwrap();
        let b = manager.generate_client_id().await.unwrap();

        assert!(a.starts_with("auto-"));
        assert_eq!(a.len(), "auto-".len() + 32);
        assert!(a[5..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn close_stops_the_store() {
        let manager = manager_with(Arc::new(NoopWillPublisher), Duration::ZERO);
        manager.close().await.unwrap();
        assert!(matches!(
            manager.create("c1", true, 0, ProtocolVersion::V5).await,
            Err(SessionError::Store(_))
        ));
        // idempotent
        manager.close().await.unwrap();
    }
}
