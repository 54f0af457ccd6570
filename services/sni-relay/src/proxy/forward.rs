//! Splicing a matched client/backend pair.
//!
//! The buffered ClientHello is replayed to the backend before any other byte
//! moves, then both directions are copied concurrently. The first direction
//! to finish (EOF or error) ends the forward: the other direction is
//! cancelled and both connections are shut down and dropped. With an idle
//! timeout, the forward also ends once neither direction has moved bytes
//! for that long.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::listener::RelayStats;
use crate::error::RelayError;

/// Copy buffer size per direction.
const COPY_BUFFER_BYTES: usize = 8192;

/// A client connection matched to its backend, ready to be spliced.
pub struct PendingForward {
    /// Inbound connection.
    pub client: TcpStream,
    /// Outbound connection to the resolved backend.
    pub server: TcpStream,
    /// Bytes already consumed from the client (the ClientHello).
    pub prefix: Vec<u8>,
    /// Server name the backend was resolved from.
    pub hostname: String,
    /// Client address.
    pub peer_addr: SocketAddr,
    /// Connection-limit permit, released when the forward ends.
    permit: Option<OwnedSemaphorePermit>,
}

impl PendingForward {
    /// Create a pending forward.
    pub fn new(
        client: TcpStream,
        server: TcpStream,
        prefix: Vec<u8>,
        hostname: String,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            client,
            server,
            prefix,
            hostname,
            peer_addr,
            permit: None,
        }
    }

    /// Hold a connection-limit permit for the lifetime of the forward.
    pub fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self.permit = permit;
        self
    }
}

impl fmt::Debug for PendingForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingForward")
            .field("hostname", &self.hostname)
            .field("peer_addr", &self.peer_addr)
            .field("prefix_len", &self.prefix.len())
            .finish_non_exhaustive()
    }
}

/// Copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished forward.
#[derive(Debug)]
pub struct ForwardOutcome {
    /// Bytes written to the backend, prefix included.
    pub bytes_to_server: u64,
    /// Bytes written to the client.
    pub bytes_to_client: u64,
    /// Direction whose end closed the forward, `None` on idle timeout.
    pub ended_by: Option<Direction>,
    /// Error that ended it, if it was not a clean EOF.
    pub error: Option<RelayError>,
}

/// Runs forwards to completion.
pub struct Forwarder {
    idle_timeout: Option<Duration>,
    stats: Arc<RelayStats>,
}

impl Forwarder {
    /// Create a forwarder.
    pub fn new(idle_timeout: Option<Duration>, stats: Arc<RelayStats>) -> Self {
        Self {
            idle_timeout,
            stats,
        }
    }

    /// Forward and log the outcome. Errors stop here.
    pub async fn run(&self, pending: PendingForward) {
        match self.forward(pending).await {
            Ok(outcome) => {
                if let Some(e) = &outcome.error {
                    debug!(
                        ended_by = outcome.ended_by.map_or("idle", |d| d.as_str()),
                        reason = e.reason_code(),
                        error = %e,
                        "Forward ended with error"
                    );
                }
                debug!(
                    bytes_to_server = outcome.bytes_to_server,
                    bytes_to_client = outcome.bytes_to_client,
                    ended_by = outcome.ended_by.map_or("idle", |d| d.as_str()),
                    "Forward closed"
                );
            }
            Err(e) => {
                warn!(reason = e.reason_code(), error = %e, "Forward aborted");
            }
        }
    }

    /// Replay the prefix, splice both directions, and close both connections.
    ///
    /// Fails only when the prefix cannot be replayed; the forward is then
    /// abandoned and both connections closed.
    pub async fn forward(&self, pending: PendingForward) -> Result<ForwardOutcome, RelayError> {
        let PendingForward {
            mut client,
            mut server,
            prefix,
            permit,
            ..
        } = pending;
        let _permit = permit;

        self.stats.forwards_started.fetch_add(1, Ordering::Relaxed);
        self.stats.forwards_active.fetch_add(1, Ordering::Relaxed);

        let result = self.replay_and_splice(&mut client, &mut server, &prefix).await;

        self.stats.forwards_active.fetch_sub(1, Ordering::Relaxed);
        match &result {
            Ok(outcome) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(outcome.bytes_to_server, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(outcome.bytes_to_client, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.prefix_replay_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    async fn replay_and_splice(
        &self,
        client: &mut TcpStream,
        server: &mut TcpStream,
        prefix: &[u8],
    ) -> Result<ForwardOutcome, RelayError> {
        if !prefix.is_empty() {
            server
                .write_all(prefix)
                .await
                .map_err(RelayError::PrefixReplay)?;
        }

        let mut outcome = splice(client, server, self.idle_timeout).await;
        outcome.bytes_to_server += prefix.len() as u64;
        Ok(outcome)
    }
}

/// Last moment either direction moved bytes.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Resolve once neither direction has moved bytes for `limit`.
async fn idle_watch(activity: &Activity, limit: Option<Duration>) {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };

    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Copy both directions until either ends or the pair goes idle, then shut
/// down both write halves.
async fn splice(
    client: &mut TcpStream,
    server: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> ForwardOutcome {
    let (mut client_read, mut client_write) = client.split();
    let (mut server_read, mut server_write) = server.split();

    let activity = Activity::new();
    let mut bytes_to_server = 0u64;
    let mut bytes_to_client = 0u64;

    let (ended_by, error) = tokio::select! {
        result = copy_half(&mut client_read, &mut server_write, &activity, &mut bytes_to_server) => {
            (Some(Direction::ClientToServer), result.err().map(RelayError::Splice))
        }
        result = copy_half(&mut server_read, &mut client_write, &activity, &mut bytes_to_client) => {
            (Some(Direction::ServerToClient), result.err().map(RelayError::Splice))
        }
        _ = idle_watch(&activity, idle_timeout) => {
            (None, Some(RelayError::IdleTimeout))
        }
    };

    // Errors here only mean the peer is already gone.
    let _ = server_write.shutdown().await;
    let _ = client_write.shutdown().await;

    ForwardOutcome {
        bytes_to_server,
        bytes_to_client,
        ended_by,
        error,
    }
}

/// Copy one direction until EOF, recording the bytes written.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
        activity.touch();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Two connected sockets: (near end, far end).
    pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (near, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (near.unwrap(), accepted.unwrap().0)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_prefix_replayed_before_client_bytes() {
        let (mut client_app, client_side) = tcp_pair().await;
        let (server_side, mut backend) = tcp_pair().await;

        let stats = Arc::new(RelayStats::default());
        let forwarder = Forwarder::new(None, Arc::clone(&stats));
        let pending = PendingForward::new(
            client_side,
            server_side,
            b"hello-prefix|".to_vec(),
            "backend.example".to_string(),
            peer(),
        );
        let task = tokio::spawn(async move { forwarder.forward(pending).await });

        client_app.write_all(b"after").await.unwrap();
        client_app.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello-prefix|after");

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_to_server, 18);
        assert_eq!(outcome.ended_by, Some(Direction::ClientToServer));
        assert!(outcome.error.is_none());
        assert_eq!(stats.snapshot().bytes_to_backend, 18);
        assert_eq!(stats.snapshot().forwards_active, 0);
    }

    #[tokio::test]
    async fn test_backend_close_closes_client() {
        let (mut client_app, client_side) = tcp_pair().await;
        let (server_side, mut backend) = tcp_pair().await;

        let forwarder = Forwarder::new(None, Arc::new(RelayStats::default()));
        let pending = PendingForward::new(
            client_side,
            server_side,
            b"hello".to_vec(),
            "backend.example".to_string(),
            peer(),
        );
        let task = tokio::spawn(async move { forwarder.forward(pending).await });

        let mut prefix = [0u8; 5];
        backend.read_exact(&mut prefix).await.unwrap();
        backend.write_all(b"response").await.unwrap();
        drop(backend);

        // The client never closes its side, yet it still sees EOF.
        let mut received = Vec::new();
        client_app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"response");

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.ended_by, Some(Direction::ServerToClient));
        assert_eq!(outcome.bytes_to_client, 8);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_forward() {
        let (mut client_app, client_side) = tcp_pair().await;
        let (server_side, mut backend) = tcp_pair().await;

        let forwarder = Forwarder::new(
            Some(Duration::from_millis(50)),
            Arc::new(RelayStats::default()),
        );
        let pending = PendingForward::new(
            client_side,
            server_side,
            Vec::new(),
            "idle.example".to_string(),
            peer(),
        );

        let outcome = forwarder.forward(pending).await.unwrap();
        assert!(matches!(outcome.error, Some(RelayError::IdleTimeout)));
        assert!(outcome.ended_by.is_none());

        let mut buf = Vec::new();
        assert_eq!(backend.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(client_app.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_way_stream_outlives_idle_timeout() {
        let (mut client_app, client_side) = tcp_pair().await;
        let (server_side, mut backend) = tcp_pair().await;

        let forwarder = Forwarder::new(
            Some(Duration::from_millis(100)),
            Arc::new(RelayStats::default()),
        );
        let pending = PendingForward::new(
            client_side,
            server_side,
            Vec::new(),
            "download.example".to_string(),
            peer(),
        );
        let task = tokio::spawn(async move { forwarder.forward(pending).await });

        // 25 chunks 20ms apart: far longer than the timeout in total, while
        // the client never sends a byte.
        let writer = tokio::spawn(async move {
            for _ in 0..25 {
                backend.write_all(&[0x42; 100]).await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok::<_, io::Error>(())
        });

        let mut received = Vec::new();
        client_app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 2500);
        writer.await.unwrap().unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.ended_by, Some(Direction::ServerToClient));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.bytes_to_client, 2500);
    }

    #[tokio::test]
    async fn test_failed_prefix_replay_aborts_forward() {
        let (mut client_app, client_side) = tcp_pair().await;
        let (mut server_side, _backend) = tcp_pair().await;

        // Writes on a shut down socket fail immediately.
        server_side.shutdown().await.unwrap();

        let stats = Arc::new(RelayStats::default());
        let forwarder = Forwarder::new(None, Arc::clone(&stats));
        let pending = PendingForward::new(
            client_side,
            server_side,
            vec![0x16; 64 * 1024],
            "gone.example".to_string(),
            peer(),
        );

        let result = forwarder.forward(pending).await;
        assert!(matches!(result, Err(RelayError::PrefixReplay(_))));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.prefix_replay_failed, 1);
        assert_eq!(snapshot.forwards_active, 0);
        assert_eq!(snapshot.bytes_to_backend, 0);

        let mut buf = Vec::new();
        assert_eq!(client_app.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::ClientToServer.to_string(), "client_to_server");
        assert_eq!(Direction::ServerToClient.as_str(), "server_to_client");
    }
}
