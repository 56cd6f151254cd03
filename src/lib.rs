//! EmberMQ - embeddable MQTT v3.1.1/v5.0 broker core
//!
//! The protocol heart of a broker without its outer shell: connection
//! lifecycle and pooling, session state with pluggable persistence,
//! QoS 1/2 delivery state machines, trie-based topic routing with shared
//! subscriptions, a retained-message store, and graceful-shutdown
//! coordination. The wire codec, TLS setup and listener plumbing live
//! outside; this crate consumes and produces decoded packets.

pub mod connection;
pub mod protocol;
pub mod qos;
pub mod retained;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod topic;

pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionState, MetaValue, Pool, PoolConfig,
    PoolError, PoolStats, TlsPeerState,
};
pub use protocol::{Packet, ProtocolVersion, Publish, QoS, ReasonCode};
pub use qos::{QosConfig, QosEngine, QosError, QosHandler, QosStats};
pub use retained::{RetainedConfig, RetainedMessage, RetainedStore};
pub use router::{RouteTarget, Router, Subscription};
pub use session::{
    ExpiryConfig, MemorySessionStore, NoopWillPublisher, Session, SessionError, SessionManager,
    SessionState, SessionStore, StoreError, WillPublisher,
};
pub use session::fjall::FjallSessionStore;
pub use shutdown::{DisconnectCoordinator, DisconnectHandler, ShutdownConfig, ShutdownError};
pub use topic::{topic_matches_filter, validate_topic_filter, validate_topic_name, TopicError};
