//! L4 TLS passthrough relay.
//!
//! This module provides:
//! - TCP listener management
//! - SNI extraction from the first read
//! - Backend resolution and dialing by server name
//! - Dispatch of matched pairs to forward tasks
//! - Bidirectional splicing
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Intake (read, SNI, dial) -> Dispatch channel -> Dispatcher
//!                                                                          |
//!                                              Backend <-> Forwarder <-----+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendDialer, Forwarder, Intake, Listener, ListenerConfig, RelayStats};
//!
//! let stats = Arc::new(RelayStats::default());
//! let intake = Arc::new(Intake::new(Arc::new(BackendDialer::new()), Arc::clone(&stats)));
//! let forwarder = Arc::new(Forwarder::new(None, Arc::clone(&stats)));
//! let (sender, dispatcher) = proxy::dispatch::channel(forwarder);
//! tokio::spawn(dispatcher.run());
//!
//! let config = ListenerConfig::new("0.0.0.0:8443".parse()?);
//! let listener = Arc::new(Listener::bind(config, intake, sender, stats).await?);
//! listener.run().await?;
//! ```

mod backend;
pub mod dispatch;
mod forward;
mod intake;
mod listener;
mod sni;

pub use backend::{BackendDialer, Resolver, StaticResolver, SystemResolver, DEFAULT_BACKEND_PORT};
pub use dispatch::{DispatchSender, Dispatcher};
pub use forward::{Direction, ForwardOutcome, Forwarder, PendingForward};
pub use intake::{read_first, Intake, DEFAULT_READ_BUFFER_BYTES};
pub use listener::{Listener, ListenerConfig, RelayStats, RelayStatsSnapshot};
pub use sni::{extract_server_name, parse_server_name, SniResult};
