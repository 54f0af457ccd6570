//! TCP listener and connection intake fan-out.
//!
//! Every accepted connection gets its own intake task. Completed intakes are
//! handed to the dispatcher; failed ones are logged and dropped. An optional
//! connection limit rejects new clients while the limit is reached, and a
//! permit stays attached to the connection until its forward ends.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatch::DispatchSender;
use super::intake::Intake;
use crate::error::RelayError;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration with no connection limit.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 0,
        }
    }
}

/// Relay-wide counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// SNI extraction successes.
    pub sni_found: AtomicU64,
    /// SNI extraction failures (read error, not TLS, no server_name).
    pub sni_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend resolution or connection failures.
    pub backend_failed: AtomicU64,
    /// Forwards handed to the forwarder.
    pub forwards_started: AtomicU64,
    /// Forwards currently splicing.
    pub forwards_active: AtomicU64,
    /// Forwards abandoned because the prefix could not be replayed.
    pub prefix_replay_failed: AtomicU64,
    /// Bytes written to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes written back to clients.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub sni_found: u64,
    pub sni_failed: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub forwards_started: u64,
    pub forwards_active: u64,
    pub prefix_replay_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl RelayStats {
    /// Read every counter.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            sni_found: self.sni_found.load(Ordering::Relaxed),
            sni_failed: self.sni_failed.load(Ordering::Relaxed),
            backend_connected: self.backend_connected.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            forwards_started: self.forwards_started.load(Ordering::Relaxed),
            forwards_active: self.forwards_active.load(Ordering::Relaxed),
            prefix_replay_failed: self.prefix_replay_failed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }
}

/// A TCP listener for the relay.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Per-connection intake.
    intake: Arc<Intake>,
    /// Hand-off to the dispatcher.
    dispatch: DispatchSender,
    /// Connection semaphore, when a limit is configured.
    conn_semaphore: Option<Arc<Semaphore>>,
    /// Statistics.
    stats: Arc<RelayStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        intake: Arc<Intake>,
        dispatch: DispatchSender,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        let bind_err = |source| RelayError::Bind {
            addr: config.bind_addr,
            source,
        };
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let conn_semaphore =
            (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));

        Ok(Self {
            listener,
            intake,
            dispatch,
            conn_semaphore,
            stats,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match &self.conn_semaphore {
                        Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                self.stats
                                    .connections_rejected
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                continue;
                            }
                        },
                        None => None,
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, peer_addr, permit).await;
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Run intake for one connection and submit the result.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        debug!(peer_addr = %peer_addr, "Handling connection");

        let submitted = match self.intake.accept(stream, peer_addr).await {
            Ok(pending) => self.dispatch.submit(pending.with_permit(permit)),
            Err(e) => Err(e),
        };

        if let Err(e) = submitted {
            debug!(
                peer_addr = %peer_addr,
                reason = e.reason_code(),
                error = %e,
                "Connection abandoned"
            );
        }
    }
}
