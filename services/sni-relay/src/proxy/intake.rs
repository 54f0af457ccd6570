//! Per-connection intake: read, sniff, dial.
//!
//! Exactly one read is issued on a fresh connection. Whatever it returns must
//! hold the whole ClientHello up to the server_name extension; a hello split
//! across reads or larger than the buffer is treated as having no server name.
//! Any failure abandons the connection by dropping it, and no reply is sent.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::backend::BackendDialer;
use super::forward::PendingForward;
use super::listener::RelayStats;
use super::sni::{parse_server_name, SniResult};
use crate::error::RelayError;

/// Default size of the single ClientHello read.
pub const DEFAULT_READ_BUFFER_BYTES: usize = 4096;

/// Turns accepted connections into pending forwards.
pub struct Intake {
    dialer: Arc<BackendDialer>,
    buffer_bytes: usize,
    read_timeout: Option<Duration>,
    stats: Arc<RelayStats>,
}

impl Intake {
    /// Create an intake with the default 4 KiB buffer and no read timeout.
    pub fn new(dialer: Arc<BackendDialer>, stats: Arc<RelayStats>) -> Self {
        Self {
            dialer,
            buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            read_timeout: None,
            stats,
        }
    }

    /// Set the size of the single read.
    pub fn buffer_bytes(mut self, buffer_bytes: usize) -> Self {
        self.buffer_bytes = buffer_bytes.max(1);
        self
    }

    /// Bound the first read with a timeout.
    pub fn read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Read the ClientHello, resolve its server name, and dial the backend.
    ///
    /// On error the client connection is dropped with the returned error.
    pub async fn accept(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<PendingForward, RelayError> {
        let prefix = read_first(&mut client, self.buffer_bytes, self.read_timeout).await?;

        let hostname = match parse_server_name(&prefix) {
            SniResult::Found(hostname) => {
                self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                hostname
            }
            other => {
                self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    result = other.as_str(),
                    bytes_read = prefix.len(),
                    "No server name in first read"
                );
                return Err(RelayError::NoServerName);
            }
        };
        debug!(hostname = %hostname, "SNI extracted");

        let server = match self.dialer.connect(&hostname).await {
            Ok(server) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                server
            }
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        Ok(PendingForward::new(client, server, prefix, hostname, peer_addr))
    }
}

/// Issue one read of at most `buffer_bytes` and return what arrived.
///
/// EOF before any byte is an error.
pub async fn read_first<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer_bytes: usize,
    read_timeout: Option<Duration>,
) -> Result<Vec<u8>, RelayError> {
    let mut buffer = vec![0u8; buffer_bytes];

    let read = stream.read(&mut buffer);
    let n = match read_timeout {
        Some(limit) => match timeout(limit, read).await {
            Ok(result) => result.map_err(RelayError::Read)?,
            Err(_) => return Err(RelayError::ReadTimeout),
        },
        None => read.await.map_err(RelayError::Read)?,
    };

    if n == 0 {
        return Err(RelayError::EmptyRead);
    }

    buffer.truncate(n);
    Ok(buffer)
}
