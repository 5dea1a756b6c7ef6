pub mod config;
pub mod dns;
pub mod proxy;
pub mod resolver;
pub mod target;

pub use config::{Cli, Config, ConfigError, LogFormat, Protocol, ResolutionMode};
pub use dns::{DnsClient, DnsError, SrvTarget, UdpDnsClient};
pub use proxy::{
    bind_udp, connection_queue, target_handoff, Dialer, Listener, TcpDispatcher, TokioDialer,
    UdpDispatcher,
};
pub use resolver::{ChangeDetector, Resolver};
pub use target::{ResolvedTargetSet, TargetSpec};
