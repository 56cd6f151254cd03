//! Connection lifecycle
//!
//! One [`Connection`] wraps a single peer link: the split byte stream,
//! a monotonic state machine, activity and byte counters, a typed
//! metadata bag for higher layers, and a close signal any number of
//! observers can await.

pub mod pool;

pub use pool::{Pool, PoolConfig, PoolError, PoolStats};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use compact_str::CompactString;
use parking_lot::RwLock;
use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Errors surfaced by connection I/O and lifecycle operations
#[derive(Debug)]
pub enum ConnectionError {
    /// The connection has been closed; all I/O after close fails this way
    Closed,
    /// The configured read/write deadline elapsed
    Timeout,
    /// The keep-alive window passed without traffic; the connection is
    /// being destructively closed
    KeepAliveTimeout,
    /// Underlying transport failure
    Io(std::io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "i/o deadline elapsed"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Connection lifecycle state
///
/// States only ever advance; no observer sees a regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted but not yet ready for traffic
    Connecting = 0,
    /// Fully established
    Connected = 1,
    /// Close has begun
    Closing = 2,
    /// Closed; terminal
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Typed metadata value stored on a connection
///
/// Higher layers stash small facts here (listener name, authenticated
/// user, negotiated limits). `Handle` is an index into a caller-owned
/// registry for anything that does not fit the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    Integer(i64),
    Text(String),
    Flag(bool),
    Blob(Bytes),
    Handle(u64),
}

/// TLS peer details attached by the TLS acceptor glue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPeerState {
    /// SNI hostname presented by the peer
    pub server_name: Option<String>,
    /// Negotiated protocol version, e.g. "TLSv1.3"
    pub protocol: Option<String>,
    /// Peer leaf certificate in DER form, when client auth ran
    pub peer_certificate: Option<Bytes>,
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline applied to each read (zero disables)
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Deadline applied to each write (zero disables)
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// TCP keep-alive probe interval for TCP-backed connections (zero disables)
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

/// A single peer link
///
/// Reads and writes may run concurrently from different tasks (the halves
/// are guarded independently); two concurrent readers or writers are the
/// caller's responsibility to avoid.
pub struct Connection<S> {
    id: u64,
    config: ConnectionConfig,
    state: AtomicU8,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Milliseconds since `epoch`; paired with the I/O that produced it
    last_activity_ms: AtomicU64,
    epoch: Instant,
    created_at: Instant,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    tls: Option<TlsPeerState>,
    metadata: RwLock<AHashMap<CompactString, MetaValue>>,
    closed_tx: watch::Sender<bool>,
}

impl Connection<TcpStream> {
    /// Wrap an accepted TCP stream, arming TCP keep-alive and capturing
    /// the peer addresses.
    pub fn from_tcp(stream: TcpStream, id: u64, config: ConnectionConfig) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();

        if !config.tcp_keepalive.is_zero() {
            let keepalive = TcpKeepalive::new().with_time(config.tcp_keepalive);
            let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);
        }

        let mut conn = Self::new(stream, id, config);
        conn.remote_addr = remote_addr;
        conn.local_addr = local_addr;
        conn
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wrap an established stream; the connection starts Connected with
    /// the activity clock armed.
    pub fn new(stream: S, id: u64, config: ConnectionConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        let epoch = Instant::now();

        Self {
            id,
            config,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            epoch,
            created_at: epoch,
            remote_addr: None,
            local_addr: None,
            tls: None,
            metadata: RwLock::new(AHashMap::new()),
            closed_tx,
        }
    }

    /// Attach TLS peer details (acceptor glue, before the connection is shared)
    pub fn with_tls_peer(mut self, tls: TlsPeerState) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Attach peer addresses for non-TCP transports
    pub fn with_addrs(mut self, remote: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        self.remote_addr = remote;
        self.local_addr = local;
        self
    }

    /// Read into `buf`, applying the configured read deadline
    ///
    /// Fails with [`ConnectionError::Closed`] unless the connection is
    /// Connected; a close racing the read cancels it cleanly.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::Closed);
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let mut reader = self.reader.lock().await;

        let n = tokio::select! {
            biased;

            _ = closed_rx.wait_for(|closed| *closed) => return Err(ConnectionError::Closed),
            result = Self::with_deadline(self.config.read_timeout, reader.read(buf)) => result?,
        };

        if n > 0 {
            self.bytes_read.fetch_add(n as u64, Ordering::Release);
            self.touch();
        }
        Ok(n)
    }

    /// Write from `buf`, applying the configured write deadline
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::Closed);
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let mut writer = self.writer.lock().await;

        let n = tokio::select! {
            biased;

            _ = closed_rx.wait_for(|closed| *closed) => return Err(ConnectionError::Closed),
            result = Self::with_deadline(self.config.write_timeout, writer.write(buf)) => result?,
        };

        if n > 0 {
            self.bytes_written.fetch_add(n as u64, Ordering::Release);
            self.touch();
        }
        Ok(n)
    }

    async fn with_deadline<F>(deadline: Duration, io: F) -> Result<usize, ConnectionError>
    where
        F: std::future::Future<Output = std::io::Result<usize>>,
    {
        if deadline.is_zero() {
            return Ok(io.await?);
        }
        match tokio::time::timeout(deadline, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection
    ///
    /// Idempotent: the first caller transitions Connected -> Closing ->
    /// Closed, shuts the stream down and fires the close signal; later
    /// callers get Ok.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < ConnectionState::Closing as u8 {
                    Some(ConnectionState::Closing as u8)
                } else {
                    None
                }
            })
            .is_ok();

        if !won {
            return Ok(());
        }

        // Signal first so pending reads/writes unblock and release the
        // half locks.
        let _ = self.closed_tx.send(true);

        let result = {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };

        self.advance_state(ConnectionState::Closed);

        result.map_err(ConnectionError::from)
    }

    fn advance_state(&self, to: ConnectionState) {
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    /// Receiver resolving to `true` once close has run; late subscribers
    /// observe the current value immediately.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn touch(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Instant of the last successful byte transfer
    pub fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Time since the last successful byte transfer
    pub fn idle_duration(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// True once the keep-alive window (1.5x the negotiated interval) has
    /// passed without traffic; zero keep-alive never times out.
    pub fn keep_alive_expired(&self, keep_alive_secs: u16) -> bool {
        if keep_alive_secs == 0 {
            return false;
        }
        let window = Duration::from_secs((keep_alive_secs as u64 * 3) / 2);
        self.idle_duration() > window
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls_peer_state(&self) -> Option<&TlsPeerState> {
        self.tls.as_ref()
    }

    pub fn metadata_get(&self, key: &str) -> Option<MetaValue> {
        self.metadata.read().get(key).cloned()
    }

    pub fn metadata_set(&self, key: &str, value: MetaValue) {
        self.metadata.write().insert(CompactString::new(key), value);
    }

    pub fn metadata_delete(&self, key: &str) -> Option<MetaValue> {
        self.metadata.write().remove(key)
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field(
                "state",
                &ConnectionState::from_u8(self.state.load(Ordering::Acquire)),
            )
            .field("remote_addr", &self.remote_addr)
            .field("bytes_read", &self.bytes_read.load(Ordering::Acquire))
            .field("bytes_written", &self.bytes_written.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    #[tokio::test]
    async fn read_write_update_counters_and_activity() {
        let (client, server) = duplex(64);
        let conn = Connection::new(server, 1, config());

        let mut peer = client;
        peer.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(conn.bytes_read(), 5);

        let written = conn.write(b"ok").await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(conn.bytes_written(), 2);
        assert!(conn.idle_duration() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (_client, server) = duplex(64);
        let conn = Connection::new(server, 7, config());

        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        // second close is a no-op
        conn.close().await.unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            conn.write(b"x").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_signal_wakes_observers() {
        let (_client, server) = duplex(64);
        let conn = std::sync::Arc::new(Connection::new(server, 2, config()));

        let observer = conn.clone();
        let waiter = tokio::spawn(async move { observer.closed().await });

        conn.close().await.unwrap();
        waiter.await.unwrap();

        // late subscriber resolves immediately
        conn.closed().await;
    }

    #[tokio::test]
    async fn close_cancels_pending_read() {
        let (_client, server) = duplex(64);
        let conn = std::sync::Arc::new(Connection::new(server, 3, config()));

        let reader = conn.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn read_deadline_times_out() {
        let (_client, server) = duplex(64);
        let conn = Connection::new(
            server,
            4,
            ConnectionConfig {
                read_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        );

        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(ConnectionError::Timeout)
        ));
        // a timeout does not close the connection
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn metadata_bag() {
        let (_client, server) = duplex(64);
        let conn = Connection::new(server, 5, config());

        conn.metadata_set("listener", MetaValue::Text("tcp-1883".into()));
        conn.metadata_set("authenticated", MetaValue::Flag(true));
        assert_eq!(
            conn.metadata_get("listener"),
            Some(MetaValue::Text("tcp-1883".into()))
        );
        assert_eq!(
            conn.metadata_delete("authenticated"),
            Some(MetaValue::Flag(true))
        );
        assert_eq!(conn.metadata_get("authenticated"), None);
    }

    #[tokio::test]
    async fn keep_alive_window() {
        let (_client, server) = duplex(64);
        let conn = Connection::new(server, 6, config());

        assert!(!conn.keep_alive_expired(0));
        assert!(!conn.keep_alive_expired(60));
    }
}
