//! Outbound connections to backends.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// Opens connections to backend addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect a stream to `addr`, giving up after `connect_timeout`.
    async fn dial_tcp(&self, addr: &str, connect_timeout: Duration) -> io::Result<TcpStream>;

    /// Bind an ephemeral datagram socket connected to `addr`.
    async fn dial_udp(&self, addr: &str) -> io::Result<UdpSocket>;
}

/// Dialer backed by tokio sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial_tcp(&self, addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
        debug!(backend_addr = %addr, "Connecting to backend");

        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    async fn dial_udp(&self, addr: &str) -> io::Result<UdpSocket> {
        let remote = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{addr}` did not resolve to an address"),
            )
        })?;

        let local = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(
            backend_addr = %remote,
            local_addr = ?socket.local_addr().ok(),
            "UDP backend dialed"
        );
        Ok(socket)
    }
}
