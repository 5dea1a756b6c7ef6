//! Command line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::target::TargetSpec;

/// Default interval between DNS refreshes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Default TCP connect timeout to a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Port assumed for a DNS server given without one.
const DNS_PORT: u16 = 53;

/// Configuration errors. All of these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("empty target specification")]
    EmptyTarget,

    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid listen address `{0}`")]
    InvalidListenAddr(String),

    #[error("invalid DNS server address `{0}`")]
    InvalidDnsServer(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Forward TCP or UDP traffic to backends discovered through DNS.
#[derive(Debug, Parser)]
#[command(name = "dynfwd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on, `ip:port` or `:port`.
    pub listen: String,

    /// Backend targets, `host:port`, `[v6]:port` or `:port`; SRV names in --srv mode.
    #[arg(required = true, num_args = 1.., value_delimiter = ',')]
    pub targets: Vec<String>,

    /// UDP mode.
    #[arg(long, env = "DYNFWD_UDP")]
    pub udp: bool,

    /// Resolve targets as SRV records, then their targets as A records.
    #[arg(long, env = "DYNFWD_SRV")]
    pub srv: bool,

    /// DNS server address (`ip` or `ip:port`); the system resolver is used if unset.
    #[arg(long, env = "DYNFWD_DNS")]
    pub dns: Option<String>,

    /// Time between DNS queries.
    #[arg(
        long,
        env = "DYNFWD_DNS_INTERVAL",
        default_value = "20s",
        value_parser = humantime::parse_duration
    )]
    pub dns_interval: Duration,

    /// TCP connect timeout.
    #[arg(
        long,
        env = "DYNFWD_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// Print noticeable info.
    #[arg(long)]
    pub verbose: bool,

    /// Print every connection, implies --verbose.
    #[arg(long)]
    pub debug: bool,

    /// Log output format.
    #[arg(
        long,
        env = "DYNFWD_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Json
    )]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Listening protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// How targets that need DNS are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// `host` -> A records, paired with the configured port.
    A,
    /// `host` -> SRV records -> A records, paired with the SRV port.
    Srv,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on.
    pub listen_addr: SocketAddr,

    /// Backend targets in configured order.
    pub targets: Vec<TargetSpec>,

    /// TCP or UDP.
    pub protocol: Protocol,

    /// Plain A or SRV-then-A resolution.
    pub mode: ResolutionMode,

    /// Explicit DNS server; `None` means the system resolver's first server.
    pub dns_server: Option<SocketAddr>,

    /// Interval between DNS refreshes.
    pub poll_interval: Duration,

    /// Backend connect timeout (TCP only).
    pub connect_timeout: Duration,

    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed command line arguments.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let mode = if cli.srv {
            ResolutionMode::Srv
        } else {
            ResolutionMode::A
        };

        let targets = cli
            .targets
            .iter()
            .map(|raw| TargetSpec::parse(raw, cli.srv))
            .collect::<Result<Vec<_>, _>>()?;

        let dns_server = cli.dns.as_deref().map(parse_dns_server).transpose()?;

        if cli.dns_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("--dns-interval"));
        }
        if cli.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("--timeout"));
        }

        let log_level = if cli.debug {
            "debug"
        } else if cli.verbose {
            "info"
        } else {
            "warn"
        };

        let protocol = if cli.udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        };

        Ok(Self {
            listen_addr: parse_listen_addr(&cli.listen)?,
            targets,
            protocol,
            mode,
            dns_server,
            poll_interval: cli.dns_interval,
            connect_timeout: cli.timeout,
            log_level: log_level.to_string(),
            log_format: cli.log_format,
        })
    }
}

/// Parse `ip:port`, `[v6]:port` or `:port` (all IPv4 interfaces).
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidListenAddr(raw.to_string());
    match raw.strip_prefix(':') {
        Some(port) => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        }
        None => raw.parse().map_err(|_| invalid()),
    }
}

/// Parse a DNS server as `ip:port` or a bare `ip` on port 53.
pub fn parse_dns_server(raw: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ConfigError::InvalidDnsServer(raw.to_string()))
}
