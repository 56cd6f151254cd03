//! Connection pool
//!
//! Tracks the fleet of live connections: an id-indexed map plus a bounded
//! idle list. A background sweep evicts idle connections that went stale
//! or outlived their budget. All locks are held briefly; connection
//! close runs outside them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::debug;

use super::{Connection, ConnectionState};

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Operation on a closed pool
    Closed,
    /// The pool is at `max_connections`
    Exhausted,
    /// No connection with the given id
    NotFound,
    /// Rejected configuration; carries the cause
    InvalidConfig(&'static str),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "pool closed"),
            Self::Exhausted => write!(f, "pool exhausted"),
            Self::NotFound => write!(f, "connection not found"),
            Self::InvalidConfig(cause) => write!(f, "invalid pool config: {}", cause),
        }
    }
}

impl std::error::Error for PoolError {}

/// Pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on pooled connections; must be non-zero
    pub max_connections: usize,
    /// Cap on the idle list; clamped to `max_connections`
    pub max_idle_connections: usize,
    /// Evict idle connections idle longer than this (zero disables)
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// Evict idle connections inactive longer than this (zero disables)
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    /// Background sweep period (zero disables the sweep)
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_idle_connections: 1024,
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    fn validated(mut self) -> Result<Self, PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig("max_connections must be non-zero"));
        }
        if self.max_idle_connections > self.max_connections {
            self.max_idle_connections = self.max_connections;
        }
        Ok(self)
    }
}

/// Pool counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
}

struct IdleEntry<S> {
    conn: Arc<Connection<S>>,
    idle_since: Instant,
}

/// Fleet of pooled connections
pub struct Pool<S> {
    config: PoolConfig,
    connections: RwLock<AHashMap<u64, Arc<Connection<S>>>>,
    idle: Mutex<VecDeque<IdleEntry<S>>>,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl<S> Pool<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    /// Create a pool; spawns the cleanup task when `cleanup_interval` is
    /// non-zero (requires a tokio runtime in that case).
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        let config = config.validated()?;
        let (shutdown, _) = broadcast::channel(1);

        let pool = Arc::new(Self {
            config,
            connections: RwLock::new(AHashMap::new()),
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            shutdown,
        });

        if !pool.config.cleanup_interval.is_zero() {
            let sweeper = Arc::downgrade(&pool);
            let mut shutdown_rx = pool.shutdown.subscribe();
            let interval = pool.config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let Some(pool) = sweeper.upgrade() else { break };
                            pool.sweep_idle().await;
                        }
                    }
                }
            });
        }

        Ok(pool)
    }

    /// Add a connection as active
    pub fn add(&self, conn: Arc<Connection<S>>) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            return Err(PoolError::Exhausted);
        }
        connections.insert(conn.id(), conn);
        Ok(())
    }

    /// O(1) lookup by id
    pub fn get(&self, id: u64) -> Option<Arc<Connection<S>>> {
        self.connections.read().get(&id).cloned()
    }

    /// Remove and close a connection
    pub async fn remove(&self, id: u64) -> Result<(), PoolError> {
        let conn = {
            let mut connections = self.connections.write();
            connections.remove(&id).ok_or(PoolError::NotFound)?
        };
        self.idle.lock().retain(|entry| entry.conn.id() != id);

        let _ = conn.close().await;
        Ok(())
    }

    /// Return an active connection to the idle list
    ///
    /// Closed pool or non-Connected state or a full idle list all end in
    /// the connection being removed and closed; none of these is an error.
    pub async fn release(&self, conn: Arc<Connection<S>>) {
        if self.closed.load(Ordering::Acquire) {
            let _ = conn.close().await;
            return;
        }

        if conn.state() != ConnectionState::Connected {
            let _ = self.remove(conn.id()).await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() >= self.config.max_idle_connections {
                true
            } else {
                idle.push_back(IdleEntry {
                    conn: conn.clone(),
                    idle_since: Instant::now(),
                });
                false
            }
        };

        if overflow {
            let _ = self.remove(conn.id()).await;
        }
    }

    /// Visit a snapshot of the pooled connections outside any lock
    ///
    /// The visitor returns false to stop early; the overall return is
    /// false when the visit was cut short.
    pub fn for_each<F>(&self, mut visitor: F) -> bool
    where
        F: FnMut(&Arc<Connection<S>>) -> bool,
    {
        let snapshot: Vec<Arc<Connection<S>>> =
            self.connections.read().values().cloned().collect();
        for conn in &snapshot {
            if !visitor(conn) {
                return false;
            }
        }
        true
    }

    /// Close the pool: stop the sweep, then remove and close everything.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());

        let drained: Vec<Arc<Connection<S>>> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        self.idle.lock().clear();

        for conn in drained {
            let _ = conn.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current counters; `active + idle == total <= max_connections`
    pub fn stats(&self) -> PoolStats {
        let total = self.connections.read().len();
        let idle = self.idle.lock().len();
        PoolStats {
            active: total.saturating_sub(idle),
            idle,
            total,
        }
    }

    /// One sweep over the idle list, evicting stale entries
    async fn sweep_idle(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Connection<S>>> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut evict = Vec::new();
            for entry in idle.drain(..) {
                if self.idle_entry_expired(&entry, now) {
                    evict.push(entry.conn);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
            evict
        };

        for conn in expired {
            debug!(id = conn.id(), "Evicting idle connection");
            let _ = self.remove(conn.id()).await;
        }
    }

    fn idle_entry_expired(&self, entry: &IdleEntry<S>, now: Instant) -> bool {
        if entry.conn.state() != ConnectionState::Connected {
            return true;
        }
        if !self.config.max_idle_time.is_zero()
            && now.duration_since(entry.idle_since) > self.config.max_idle_time
        {
            return true;
        }
        if !self.config.max_lifetime.is_zero()
            && now.duration_since(entry.conn.last_activity()) > self.config.max_lifetime
        {
            return true;
        }
        false
    }
}
