//! Fjall-backed session store
//!
//! Persists sessions in an LSM-tree keyspace, one partition keyed by
//! client id. Records are bincode-encoded [`StoredSession`]s; iteration
//! is in key order, which gives `list` a stable ordering for free.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::models::StoredSession;
use super::store::{SessionStore, StoreError};
use super::{Session, SessionState};

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Session store backed by a fjall keyspace
pub struct FjallSessionStore {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    closed: AtomicBool,
}

impl FjallSessionStore {
    /// Open (or create) the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let keyspace = Config::new(path).open()?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            sessions,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn serialize(stored: &StoredSession) -> Result<Vec<u8>, StoreError> {
        bincode::encode_to_vec(stored, bincode::config::standard())
            .map_err(|e| StoreError::Serialize(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<StoredSession, StoreError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|e| StoreError::Deserialize(e.to_string()))
    }
}

#[async_trait]
impl SessionStore for FjallSessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.check_open()?;
        let stored = StoredSession::from_session(session);
        let bytes = Self::serialize(&stored)?;
        self.sessions.insert(session.client_id.as_ref(), bytes)?;
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<Option<Session>, StoreError> {
        self.check_open()?;
        match self.sessions.get(client_id)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?.into_session())),
            None => Ok(None),
        }
    }

    async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.sessions.remove(client_id)?;
        Ok(())
    }

    async fn exists(&self, client_id: &str) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.sessions.get(client_id)?.is_some())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        let mut ids = Vec::new();
        for item in self.sessions.iter() {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(ids)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        let mut count = 0;
        for item in self.sessions.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    async fn count_by_state(&self, state: SessionState) -> Result<usize, StoreError> {
        self.check_open()?;
        let mut count = 0;
        for item in self.sessions.iter() {
            let (_, value) = item?;
            let stored = Self::deserialize(&value)?;
            if stored.state == state as u8 {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
