//! Relay configuration.
//!
//! Every setting is optional. The defaults reproduce the plain relay:
//! listen on 8443, dial 443, one 4 KiB read, no limits, no timeouts.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{DEFAULT_BACKEND_PORT, DEFAULT_READ_BUFFER_BYTES};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Port dialed on the resolved backend.
    pub backend_port: u16,

    /// Size of the single ClientHello read.
    pub read_buffer_bytes: usize,

    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,

    /// Deadline for the first read from the client.
    pub read_timeout: Option<Duration>,

    /// Deadline for dialing the backend.
    pub connect_timeout: Option<Duration>,

    /// Idle timeout per copy direction once spliced.
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            backend_port: DEFAULT_BACKEND_PORT,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            max_connections: 0,
            read_timeout: None,
            connect_timeout: None,
            idle_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("SNI_RELAY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("SNI_RELAY_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8443).")?;

        let backend_port: u16 = lookup("SNI_RELAY_BACKEND_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_RELAY_BACKEND_PORT must be a port number.")?
            .unwrap_or(DEFAULT_BACKEND_PORT);
        if backend_port == 0 {
            anyhow::bail!("SNI_RELAY_BACKEND_PORT must not be 0.");
        }

        let read_buffer_bytes: usize = lookup("SNI_RELAY_READ_BUFFER_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_RELAY_READ_BUFFER_BYTES must be an integer.")?
            .unwrap_or(DEFAULT_READ_BUFFER_BYTES)
            .clamp(64, 65536);

        let max_connections: usize = lookup("SNI_RELAY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_RELAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(0);

        let read_timeout = duration_ms(&lookup, "SNI_RELAY_READ_TIMEOUT_MS")?;
        let connect_timeout = duration_ms(&lookup, "SNI_RELAY_CONNECT_TIMEOUT_MS")?;
        let idle_timeout = duration_ms(&lookup, "SNI_RELAY_IDLE_TIMEOUT_MS")?;

        let log_level = lookup("SNI_RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backend_port,
            read_buffer_bytes,
            max_connections,
            read_timeout,
            connect_timeout,
            idle_timeout,
            log_level,
        })
    }
}

/// Parse an optional millisecond value; unset or 0 disables the timeout.
fn duration_ms<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: Option<u64> = lookup(key)
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;

    Ok(ms.filter(|ms| *ms > 0).map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_plain_relay() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8443");
        assert_eq!(config.backend_port, 443);
        assert_eq!(config.read_buffer_bytes, 4096);
        assert_eq!(config.max_connections, 0);
        assert!(config.read_timeout.is_none());
        assert!(config.connect_timeout.is_none());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("SNI_RELAY_LISTEN_ADDR", "127.0.0.1:9443"),
            ("SNI_RELAY_BACKEND_PORT", "8444"),
            ("SNI_RELAY_MAX_CONNECTIONS", "128"),
            ("SNI_RELAY_CONNECT_TIMEOUT_MS", "2000"),
            ("SNI_RELAY_READ_TIMEOUT_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9443");
        assert_eq!(config.backend_port, 8444);
        assert_eq!(config.max_connections, 128);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(2)));
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn test_read_buffer_is_clamped() {
        let config =
            Config::from_lookup(lookup_from(&[("SNI_RELAY_READ_BUFFER_BYTES", "1")])).unwrap();
        assert_eq!(config.read_buffer_bytes, 64);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("SNI_RELAY_LISTEN_ADDR", "nope")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("SNI_RELAY_BACKEND_PORT", "0")])).is_err());
        assert!(
            Config::from_lookup(lookup_from(&[("SNI_RELAY_IDLE_TIMEOUT_MS", "soon")])).is_err()
        );
    }
}
