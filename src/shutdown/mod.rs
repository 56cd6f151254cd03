//! Graceful disconnection and shutdown
//!
//! The [`DisconnectCoordinator`] fans received DISCONNECTs out to
//! registered handlers and drives the graceful-close path: handlers run
//! in a worker task raced against a timeout, and a timeout force-closes
//! the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::connection::{Connection, Pool};
use crate::protocol::{Disconnect, ReasonCode};

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// A graceful close did not finish inside its deadline
    GracefulShutdownTimeout,
    /// A disconnect handler failed; carries its message
    Handler(String),
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GracefulShutdownTimeout => write!(f, "graceful shutdown timed out"),
            Self::Handler(msg) => write!(f, "disconnect handler failed: {}", msg),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Coordinator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for one connection's graceful close
    #[serde(with = "humantime_serde")]
    pub graceful_timeout: Duration,
    /// Overall deadline for draining the whole pool
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Observer invoked for every DISCONNECT, received or synthesized
#[async_trait]
pub trait DisconnectHandler<S>: Send + Sync {
    async fn handle(
        &self,
        conn: &Arc<Connection<S>>,
        packet: &Disconnect,
    ) -> Result<(), ShutdownError>;
}

/// Fans out DISCONNECTs and closes connections under a deadline
pub struct DisconnectCoordinator<S> {
    config: ShutdownConfig,
    handlers: RwLock<Vec<Arc<dyn DisconnectHandler<S>>>>,
}

impl<S> DisconnectCoordinator<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a disconnect handler; handlers run in registration order
    pub fn register(&self, handler: Arc<dyn DisconnectHandler<S>>) {
        self.handlers.write().push(handler);
    }

    fn handlers_snapshot(&self) -> Vec<Arc<dyn DisconnectHandler<S>>> {
        self.handlers.read().clone()
    }

    /// Fan a received DISCONNECT out to every handler
    ///
    /// The first handler error aborts the fan-out and is returned.
    pub async fn handle_disconnect(
        &self,
        conn: &Arc<Connection<S>>,
        packet: &Disconnect,
    ) -> Result<(), ShutdownError> {
        for handler in self.handlers_snapshot() {
            handler.handle(conn, packet).await?;
        }
        Ok(())
    }

    /// Gracefully close one connection
    ///
    /// A worker task runs the handlers with a synthetic DISCONNECT for
    /// `reason_code` and then closes the connection. If the worker misses
    /// `graceful_timeout` the connection is force-closed and
    /// [`ShutdownError::GracefulShutdownTimeout`] is returned.
    pub async fn graceful_disconnect(
        &self,
        conn: Arc<Connection<S>>,
        reason_code: ReasonCode,
    ) -> Result<(), ShutdownError> {
        let packet = Disconnect::new(reason_code);
        let handlers = self.handlers_snapshot();

        let worker_conn = conn.clone();
        let worker = tokio::spawn(async move {
            let mut first_error = None;
            for handler in handlers {
                if let Err(e) = handler.handle(&worker_conn, &packet).await {
                    warn!(id = worker_conn.id(), "Disconnect handler failed: {}", e);
                    first_error = Some(e);
                    break;
                }
            }
            let _ = worker_conn.close().await;
            first_error
        });

        match tokio::time::timeout(self.config.graceful_timeout, worker).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(handler_error))) => Err(handler_error),
            Ok(Err(join_error)) => Err(ShutdownError::Handler(join_error.to_string())),
            Err(_) => {
                debug!(id = conn.id(), "Graceful disconnect timed out, force closing");
                let _ = conn.close().await;
                Err(ShutdownError::GracefulShutdownTimeout)
            }
        }
    }

    /// Drain every connection in the pool with reason ServerShuttingDown
    ///
    /// Returns the first error observed, if any; the whole drain is bound
    /// by `shutdown_timeout`, after which remaining connections are
    /// force-closed.
    pub async fn graceful_shutdown(&self, pool: &Pool<S>) -> Result<(), ShutdownError> {
        let mut connections = Vec::new();
        pool.for_each(|conn| {
            connections.push(conn.clone());
            true
        });

        let drain = async {
            let mut first_error = None;
            for conn in &connections {
                if let Err(e) = self
                    .graceful_disconnect(conn.clone(), ReasonCode::ServerShuttingDown)
                    .await
                {
                    first_error.get_or_insert(e);
                }
            }
            first_error
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(None) => Ok(()),
            Ok(Some(first_error)) => Err(first_error),
            Err(_) => {
                warn!("Shutdown deadline hit, force closing remaining connections");
                for conn in &connections {
                    let _ = conn.close().await;
                }
                Err(ShutdownError::GracefulShutdownTimeout)
            }
        }
    }
}
