//! Backend resolution and dialing.
//!
//! The relay has no static backend set: the backend is whatever the SNI
//! hostname resolves to. Resolution sits behind the [`Resolver`] trait so the
//! system resolver can be swapped for pinned addresses.
//!
//! Policy:
//! - IPv4 only: IPv6 results are discarded
//! - First remaining address only, no fallback to later addresses
//! - Fixed backend port (443 by default)
//! - No retries

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::RelayError;

/// Default port dialed on the resolved backend.
pub const DEFAULT_BACKEND_PORT: u16 = 443;

/// Hostname resolution capability.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `hostname` into socket addresses for `port`, in preference order.
    async fn resolve(&self, hostname: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((hostname, port)).await?.collect())
    }
}

/// Resolver with a fixed hostname table.
///
/// Pinned addresses keep their own port; the dial port is ignored.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    /// Create an empty resolver. Every lookup fails until hosts are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `hostname` to `addrs`.
    pub fn with_host(mut self, hostname: &str, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.insert(hostname.to_string(), addrs);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, hostname: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        self.hosts.get(hostname).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{hostname} is not pinned"))
        })
    }
}

/// Opens outbound connections to the host named in the ClientHello.
pub struct BackendDialer {
    resolver: Arc<dyn Resolver>,
    port: u16,
    connect_timeout: Option<Duration>,
}

impl BackendDialer {
    /// Create a dialer that uses the system resolver and port 443.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    /// Create a dialer with a custom resolver.
    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            port: DEFAULT_BACKEND_PORT,
            connect_timeout: None,
        }
    }

    /// Set the port dialed on resolved addresses.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bound the TCP connect with a timeout.
    pub fn connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Resolve `hostname` and connect to its first IPv4 address.
    pub async fn connect(&self, hostname: &str) -> Result<TcpStream, RelayError> {
        let addr = self.resolve_first(hostname).await?;
        debug!(hostname = %hostname, backend_addr = %addr, "Connecting to backend");

        let connect = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => return Err(RelayError::ConnectTimeout { addr }),
            },
            None => connect.await,
        };

        result.map_err(|source| RelayError::Connect { addr, source })
    }

    async fn resolve_first(&self, hostname: &str) -> Result<SocketAddr, RelayError> {
        let addrs = self
            .resolver
            .resolve(hostname, self.port)
            .await
            .map_err(|e| RelayError::UnknownHost {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .into_iter()
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| RelayError::UnknownHost {
                hostname: hostname.to_string(),
                reason: "no IPv4 addresses".to_string(),
            })
    }
}

impl Default for BackendDialer {
    fn default() -> Self {
        Self::new()
    }
}
