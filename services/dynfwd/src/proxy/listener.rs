//! Inbound sockets: the TCP accept loop and the UDP bind.
//!
//! Both only produce events for a dispatcher; no routing happens here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Capacity of the queue between the accept loop and the TCP dispatcher.
pub const CONNECTION_QUEUE_CAPACITY: usize = 10;

/// Pause after an accept error so a persistent failure does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Create the queue that carries accepted connections to the dispatcher.
pub fn connection_queue() -> (mpsc::Sender<TcpStream>, mpsc::Receiver<TcpStream>) {
    mpsc::channel(CONNECTION_QUEUE_CAPACITY)
}

/// A bound TCP listener feeding a dispatcher.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Listener bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever, handing every connection to `connections`.
    ///
    /// Accept errors are logged and do not stop the loop. Returns once the
    /// dispatcher side of the queue is gone.
    pub async fn run(self, connections: mpsc::Sender<TcpStream>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    if connections.send(stream).await.is_err() {
                        info!("Dispatcher gone; listener stopping");
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Bind the single client-facing UDP socket.
pub async fn bind_udp(addr: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await?;
    info!(bind_addr = %socket.local_addr()?, "UDP socket bound");
    Ok(Arc::new(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_accepted_connections_are_queued() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = connection_queue();
        tokio::spawn(listener.run(tx));

        let client = TcpStream::connect(addr).await.unwrap();
        let accepted = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_udp_reports_port() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
