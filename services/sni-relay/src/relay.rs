//! Wiring of a complete relay from [`Config`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::RelayError;
use crate::proxy::{
    dispatch, BackendDialer, Forwarder, Intake, Listener, ListenerConfig, RelayStats, Resolver,
};

/// A running relay: bound listener plus dispatcher task.
pub struct RelayHandle {
    /// Address the listener is bound to.
    pub local_addr: SocketAddr,
    /// Shared counters.
    pub stats: Arc<RelayStats>,
    listener_task: JoinHandle<std::io::Result<()>>,
    dispatcher_task: JoinHandle<()>,
}

impl RelayHandle {
    /// Bind the listener and start accepting.
    ///
    /// Fails only when the listener cannot be bound.
    pub async fn start(config: &Config, resolver: Arc<dyn Resolver>) -> Result<Self, RelayError> {
        let stats = Arc::new(RelayStats::default());

        let dialer = BackendDialer::with_resolver(resolver)
            .port(config.backend_port)
            .connect_timeout(config.connect_timeout);
        let intake = Intake::new(Arc::new(dialer), Arc::clone(&stats))
            .buffer_bytes(config.read_buffer_bytes)
            .read_timeout(config.read_timeout);
        let forwarder = Forwarder::new(config.idle_timeout, Arc::clone(&stats));

        let (sender, dispatcher) = dispatch::channel(Arc::new(forwarder));

        let mut listener_config = ListenerConfig::new(config.listen_addr);
        listener_config.max_connections = config.max_connections;
        let listener = Listener::bind(
            listener_config,
            Arc::new(intake),
            sender,
            Arc::clone(&stats),
        )
        .await?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: config.listen_addr,
            source,
        })?;

        let dispatcher_task = tokio::spawn(dispatcher.run());
        let listener_task = tokio::spawn(Arc::new(listener).run());

        info!(
            listen_addr = %local_addr,
            backend_port = config.backend_port,
            "Relay started"
        );

        Ok(Self {
            local_addr,
            stats,
            listener_task,
            dispatcher_task,
        })
    }

    /// Wait for the listener to stop. It only stops on error or abort.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let result = (&mut self.listener_task).await;
        result??;
        Ok(())
    }

    /// Stop accepting and stop dispatching. Running forwards are left alone.
    pub fn shutdown(&self) {
        self.listener_task.abort();
        self.dispatcher_task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
