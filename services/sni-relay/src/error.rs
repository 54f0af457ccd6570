//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Relay errors with standardized reason codes.
///
/// Only `Bind` is fatal. Everything else is scoped to a single connection
/// and ends up in a log line, never back at the client.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener could not be bound at startup.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// First read from the client failed.
    #[error("client read failed: {0}")]
    Read(#[source] io::Error),

    /// Client did not send anything before the read timeout.
    #[error("client read timed out")]
    ReadTimeout,

    /// Client closed before sending any bytes.
    #[error("client closed before sending data")]
    EmptyRead,

    /// No usable server_name in the first bytes.
    #[error("no server name in ClientHello")]
    NoServerName,

    /// Hostname resolved to nothing or resolution failed.
    #[error("unknown host {hostname}: {reason}")]
    UnknownHost { hostname: String, reason: String },

    /// Backend dial failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Backend dial did not complete in time.
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },

    /// Dispatch loop is gone.
    #[error("dispatch channel closed")]
    DispatchClosed,

    /// Replaying the buffered ClientHello to the backend failed.
    #[error("prefix replay failed: {0}")]
    PrefixReplay(#[source] io::Error),

    /// Neither direction moved bytes within the idle timeout.
    #[error("forward idle timeout")]
    IdleTimeout,

    /// Copy loop failed after the splice started.
    #[error("splice failed: {0}")]
    Splice(#[source] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Read(_) => "read_failed",
            RelayError::ReadTimeout => "read_timeout",
            RelayError::EmptyRead => "empty_read",
            RelayError::NoServerName => "no_server_name",
            RelayError::UnknownHost { .. } => "unknown_host",
            RelayError::Connect { .. } => "connect_failed",
            RelayError::ConnectTimeout { .. } => "connect_timeout",
            RelayError::DispatchClosed => "dispatch_closed",
            RelayError::PrefixReplay(_) => "prefix_replay_failed",
            RelayError::IdleTimeout => "idle_timeout",
            RelayError::Splice(_) => "splice_failed",
        }
    }
}
