//! sni-relay
//!
//! Transparent L4 relay for TLS traffic.
//!
//! This service:
//! - Accepts TCP connections on a single listener (0.0.0.0:8443 by default)
//! - Reads the TLS ClientHello and extracts the SNI hostname
//! - Resolves the hostname and dials it on port 443
//! - Replays the ClientHello and splices both connections
//!
//! TLS is never terminated.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_relay::{Config, RelayHandle, SystemResolver};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNI_RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sni-relay");
    info!(
        listen_addr = %config.listen_addr,
        backend_port = config.backend_port,
        read_buffer_bytes = config.read_buffer_bytes,
        max_connections = config.max_connections,
        read_timeout_ms = config.read_timeout.map(|d| d.as_millis() as u64),
        connect_timeout_ms = config.connect_timeout.map(|d| d.as_millis() as u64),
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        "Configuration loaded"
    );

    let relay = match RelayHandle::start(&config, Arc::new(SystemResolver)).await {
        Ok(relay) => relay,
        Err(e) => {
            error!(
                listen_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    relay.wait().await
}
