//! Hand-off between connection intake and forwarding.
//!
//! Intake tasks submit matched pairs through a [`DispatchSender`]; a single
//! [`Dispatcher`] drains the channel and starts one forward task per pair.
//! The channel is unbounded and the dispatcher never waits on a forward.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

use super::forward::{Forwarder, PendingForward};
use crate::error::RelayError;

/// Create the dispatch channel.
pub fn channel(forwarder: Arc<Forwarder>) -> (DispatchSender, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchSender { tx }, Dispatcher { rx, forwarder })
}

/// Producer side of the dispatch channel.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::UnboundedSender<PendingForward>,
}

impl DispatchSender {
    /// Queue a matched pair for forwarding.
    ///
    /// On failure the pair is dropped, closing both connections.
    pub fn submit(&self, pending: PendingForward) -> Result<(), RelayError> {
        self.tx.send(pending).map_err(|_| RelayError::DispatchClosed)
    }
}

/// Single consumer that launches forwards.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<PendingForward>,
    forwarder: Arc<Forwarder>,
}

impl Dispatcher {
    /// Launch a forward for every submitted pair. Returns once all senders are gone.
    pub async fn run(mut self) {
        info!("Dispatcher started");

        while let Some(pending) = self.rx.recv().await {
            debug!(
                hostname = %pending.hostname,
                peer_addr = %pending.peer_addr,
                "Dispatching forward"
            );

            let span = info_span!(
                "forward",
                peer = %pending.peer_addr,
                hostname = %pending.hostname
            );
            let forwarder = Arc::clone(&self.forwarder);
            tokio::spawn(async move { forwarder.run(pending).await }.instrument(span));
        }

        info!("Dispatch channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::forward::tests::tcp_pair;
    use crate::proxy::listener::RelayStats;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dispatched_forward_runs() {
        let stats = Arc::new(RelayStats::default());
        let forwarder = Arc::new(Forwarder::new(None, Arc::clone(&stats)));
        let (sender, dispatcher) = channel(forwarder);
        let dispatch_task = tokio::spawn(dispatcher.run());

        let (mut client_app, client_side) = tcp_pair().await;
        let (server_side, mut backend) = tcp_pair().await;
        sender
            .submit(PendingForward::new(
                client_side,
                server_side,
                b"hello".to_vec(),
                "dispatch.example".to_string(),
                "127.0.0.1:50001".parse().unwrap(),
            ))
            .unwrap();

        let mut prefix = [0u8; 5];
        backend.read_exact(&mut prefix).await.unwrap();
        assert_eq!(&prefix, b"hello");

        backend.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client_app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(sender);
        dispatch_task.await.unwrap();
        assert_eq!(stats.snapshot().forwards_started, 1);
    }

    #[tokio::test]
    async fn test_submit_after_dispatcher_stopped() {
        let forwarder = Arc::new(Forwarder::new(None, Arc::new(RelayStats::default())));
        let (sender, dispatcher) = channel(forwarder);
        drop(dispatcher);

        let (_client_app, client_side) = tcp_pair().await;
        let (server_side, _backend) = tcp_pair().await;
        let result = sender.submit(PendingForward::new(
            client_side,
            server_side,
            Vec::new(),
            "closed.example".to_string(),
            "127.0.0.1:50002".parse().unwrap(),
        ));

        assert!(matches!(result, Err(RelayError::DispatchClosed)));
    }
}
