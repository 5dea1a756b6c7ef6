//! dynfwd
//!
//! TCP/UDP forwarder whose backends come from DNS.
//!
//! This binary:
//! - Parses the listen address, targets and flags
//! - Resolves targets once, or keeps re-resolving them via DNS
//! - Accepts TCP connections (or binds one UDP socket) on the listen address
//! - Forwards each connection to the next backend, round robin

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dynfwd::config::{Cli, Config, LogFormat, Protocol};
use dynfwd::dns::{self, UdpDnsClient};
use dynfwd::proxy::{
    bind_udp, connection_queue, target_handoff, Dialer, Listener, TcpDispatcher, TokioDialer,
    UdpDispatcher,
};
use dynfwd::resolver::Resolver;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_cli(Cli::parse()).context("Invalid configuration")?;

    init_tracing(&config);
    ignore_hangup().context("Failed to install SIGHUP handler")?;

    info!(
        listen_addr = %config.listen_addr,
        protocol = config.protocol.as_str(),
        targets = ?config.targets.iter().map(ToString::to_string).collect::<Vec<_>>(),
        mode = ?config.mode,
        "Configuration loaded"
    );

    let mut resolver = Resolver::new(config.targets.clone(), config.mode, config.poll_interval);
    if resolver.needs_dns() {
        let server = match config.dns_server {
            Some(server) => server,
            None => dns::system_name_server()
                .context("No DNS server given and none found in system configuration")?,
        };
        info!(
            dns_server = %server,
            interval = ?config.poll_interval,
            "Will refresh targets via DNS"
        );
        resolver = resolver.with_dns(Arc::new(UdpDnsClient::new(server)));
    } else if config.dns_server.is_some() {
        info!("All targets are literal addresses; DNS server is unused");
    }

    let (targets_tx, targets_rx) = target_handoff();
    tokio::spawn(async move {
        if let Err(e) = resolver.run(targets_tx).await {
            error!(error = %e, "Resolver failed");
        }
    });

    let dialer: Arc<dyn Dialer> = Arc::new(TokioDialer);

    match config.protocol {
        Protocol::Tcp => {
            let listener = Listener::bind(config.listen_addr)
                .await
                .with_context(|| {
                    format!("Failed to set up TCP listener on `{}`", config.listen_addr)
                })?;
            let (conn_tx, conn_rx) = connection_queue();
            tokio::spawn(listener.run(conn_tx));

            TcpDispatcher::new(dialer, config.connect_timeout)
                .run(targets_rx, conn_rx)
                .await;
        }
        Protocol::Udp => {
            let socket = bind_udp(config.listen_addr)
                .await
                .with_context(|| {
                    format!("Failed to set up UDP listener on `{}`", config.listen_addr)
                })?;

            // Kept open for the life of the process so the dispatcher keeps running.
            let (_client_tx, client_rx) = mpsc::channel(1);
            _client_tx
                .send(socket)
                .await
                .context("UDP dispatcher channel closed")?;

            UdpDispatcher::new(dialer).run(targets_rx, client_rx).await;
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to --verbose/--debug.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

/// Keep running when the controlling terminal goes away.
///
/// SIGPIPE is already ignored by the Rust runtime; writes to a closed socket
/// surface as errors in the relay instead.
#[cfg(unix)]
fn ignore_hangup() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            debug!("Ignoring SIGHUP");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_hangup() -> std::io::Result<()> {
    Ok(())
}
