//! Session persistence capability
//!
//! [`SessionStore`] abstracts where sessions live; the broker core holds
//! an owned handle and never cares which backing is behind it. Two
//! implementations ship: [`MemorySessionStore`] and
//! [`FjallSessionStore`](super::fjall::FjallSessionStore).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::models::StoredSession;
use super::{Session, SessionState};

/// Errors from session persistence
#[derive(Debug)]
pub enum StoreError {
    /// Operation on a closed store
    Closed,
    /// Serialization failure
    Serialize(String),
    /// Deserialization failure
    Deserialize(String),
    /// Backend failure (disk, keyspace)
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session store closed"),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence of sessions keyed by client id
///
/// `list` returns ids in a stable order where the backing allows it
/// (the fjall store iterates its keyspace in key order).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a snapshot of the session
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Load a session; Ok(None) when absent
    async fn load(&self, client_id: &str) -> Result<Option<Session>, StoreError>;

    /// Delete a session; absent keys are fine
    async fn delete(&self, client_id: &str) -> Result<(), StoreError>;

    /// Whether a session exists
    async fn exists(&self, client_id: &str) -> Result<bool, StoreError>;

    /// All stored client ids
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Number of stored sessions
    async fn count(&self) -> Result<usize, StoreError>;

    /// Number of stored sessions in the given state
    async fn count_by_state(&self, state: SessionState) -> Result<usize, StoreError>;

    /// Close the store; every later call fails with [`StoreError::Closed`]
    async fn close(&self) -> Result<(), StoreError>;
}

/// In-memory session store
///
/// Sessions are held in their serialized form so `save` snapshots by
/// value, exactly like a persistent backing would.
pub struct MemorySessionStore {
    sessions: Mutex<AHashMap<String, StoredSession>>,
    closed: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(AHashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.check_open()?;
        let stored = StoredSession::from_session(session);
        self.sessions
            .lock()
            .insert(session.client_id.to_string(), stored);
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<Option<Session>, StoreError> {
        self.check_open()?;
        Ok(self
            .sessions
            .lock()
            .get(client_id)
            .cloned()
            .map(StoredSession::into_session))
    }

    async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.sessions.lock().remove(client_id);
        Ok(())
    }

    async fn exists(&self, client_id: &str) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.sessions.lock().contains_key(client_id))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.sessions.lock().len())
    }

    async fn count_by_state(&self, state: SessionState) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.state == state as u8)
            .count())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolVersion;
    use std::sync::Arc;

    fn session(id: &str) -> Session {
        let mut s = Session::new(Arc::from(id), ProtocolVersion::V5);
        s.clean_start = false;
        s.expiry_interval = 60;
        s
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = MemorySessionStore::new();
        store.save(&session("a")).await.unwrap();

        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.client_id.as_ref(), "a");
        assert!(!loaded.clean_start);

        assert!(store.exists("a").await.unwrap());
        store.delete("a").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
        // deleting again is fine
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn list_and_counts() {
        let store = MemorySessionStore::new();
        store.save(&session("b")).await.unwrap();
        store.save(&session("a")).await.unwrap();

        let mut disconnected = session("c");
        disconnected.set_disconnected();
        store.save(&disconnected).await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(
            store.count_by_state(SessionState::Disconnected).await.unwrap(),
            1
        );
        assert_eq!(store.count_by_state(SessionState::New).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_store_rejects_everything() {
        let store = MemorySessionStore::new();
        store.save(&session("a")).await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.save(&session("b")).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.load("a").await, Err(StoreError::Closed)));
        assert!(matches!(store.list().await, Err(StoreError::Closed)));
        assert!(matches!(store.count().await, Err(StoreError::Closed)));
    }
}
