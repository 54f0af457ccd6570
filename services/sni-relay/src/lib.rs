pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;

pub use config::Config;
pub use error::RelayError;
pub use proxy::{
    extract_server_name, parse_server_name, BackendDialer, Direction, DispatchSender, Dispatcher,
    ForwardOutcome, Forwarder, Intake, Listener, ListenerConfig, PendingForward, RelayStats,
    RelayStatsSnapshot, Resolver, SniResult, StaticResolver, SystemResolver,
};
pub use relay::RelayHandle;
