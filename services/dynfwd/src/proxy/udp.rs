//! UDP dispatcher and flow forwarder.
//!
//! UDP mode has exactly one client-facing socket and at most one backend
//! socket at a time. Every target-set update closes the current backend and
//! dials the next round-robin pick; the forwarder bound to the old backend
//! notices the close and exits on its own.
//!
//! Traffic is one way only: datagrams from clients are sent to the backend,
//! nothing is relayed back.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use super::dialer::Dialer;
use super::dispatch::DispatchState;
use crate::target::ResolvedTargetSet;

/// Pause before retrying after an unexpected relay error.
pub const UDP_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Largest datagram the forwarder will carry.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Why a UDP copy loop stopped.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The backend socket was closed by the dispatcher.
    #[error("backend socket closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Backend socket for one target-set generation.
///
/// Owned by the dispatcher. Closing it (explicitly or by drop) tells the
/// forwarder holding a [`BackendLink`] to this generation to stop.
#[derive(Debug)]
pub struct UdpBackend {
    address: String,
    socket: Arc<UdpSocket>,
    closed: watch::Sender<bool>,
}

impl UdpBackend {
    pub fn new(socket: UdpSocket, address: String) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            address,
            socket: Arc::new(socket),
            closed,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close this backend. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Handle for a forwarder writing to this backend.
    pub fn link(&self) -> BackendLink {
        BackendLink {
            socket: Arc::clone(&self.socket),
            closed: self.closed.subscribe(),
        }
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// A forwarder's view of a backend: the socket plus its close signal.
#[derive(Debug)]
pub struct BackendLink {
    socket: Arc<UdpSocket>,
    closed: watch::Receiver<bool>,
}

impl BackendLink {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Owns the client socket, the current backend and the round-robin cursor.
pub struct UdpDispatcher {
    dialer: Arc<dyn Dialer>,
    state: DispatchState,
    client: Option<Arc<UdpSocket>>,
    backend: Option<UdpBackend>,
}

impl UdpDispatcher {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            state: DispatchState::new(),
            client: None,
            backend: None,
        }
    }

    /// Run the control loop until both event sources are closed.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ResolvedTargetSet>,
        mut clients: mpsc::Receiver<Arc<UdpSocket>>,
    ) {
        let mut updates_open = true;
        let mut clients_open = true;

        while updates_open || clients_open {
            tokio::select! {
                update = updates.recv(), if updates_open => match update {
                    Some(targets) => self.apply(targets).await,
                    None => {
                        debug!("Resolver finished; keeping current UDP backend");
                        updates_open = false;
                    }
                },
                client = clients.recv(), if clients_open => match client {
                    Some(socket) => self.attach_client(socket),
                    None => clients_open = false,
                },
            }
        }

        info!("UDP dispatcher stopping");
    }

    /// Close the current backend, then dial the next pick from `targets`.
    async fn apply(&mut self, targets: ResolvedTargetSet) {
        if let Some(backend) = self.backend.take() {
            backend.close();
            debug!(backend_addr = %backend.address(), "Closed UDP backend");
        }

        self.state.replace_targets(targets);
        let Some(address) = self.state.next_target() else {
            debug!("No UDP target known");
            return;
        };

        match self.dialer.dial_udp(&address).await {
            Ok(socket) => {
                info!(backend_addr = %address, "UDP backend connected");
                let backend = UdpBackend::new(socket, address);
                if let Some(client) = &self.client {
                    spawn_forwarder(Arc::clone(client), &backend);
                }
                self.backend = Some(backend);
            }
            Err(e) => {
                warn!(backend_addr = %address, error = %e, "Connection to UDP backend failed");
            }
        }
    }

    fn attach_client(&mut self, socket: Arc<UdpSocket>) {
        debug!(local_addr = ?socket.local_addr().ok(), "UDP client socket attached");
        if let Some(backend) = &self.backend {
            spawn_forwarder(Arc::clone(&socket), backend);
        }
        self.client = Some(socket);
    }
}

fn spawn_forwarder(client: Arc<UdpSocket>, backend: &UdpBackend) {
    let span = tracing::debug_span!("udp_flow", backend = %backend.address());
    tokio::spawn(forward_udp(client, backend.link()).instrument(span));
}

/// Copy datagrams from `from` to `to` until the backend is closed.
///
/// Any other error is retried after [`UDP_RETRY_BACKOFF`] on the same sockets,
/// with no upper bound on the number of retries.
pub async fn forward_udp(from: Arc<UdpSocket>, mut to: BackendLink) {
    loop {
        let mut forwarded = 0u64;
        match copy_datagrams(&from, &mut to, &mut forwarded).await {
            RelayError::Closed => {
                debug!(
                    bytes_forwarded = forwarded,
                    "UDP backend closed; forwarder exiting"
                );
                return;
            }
            RelayError::Io(e) => {
                warn!(error = %e, bytes_forwarded = forwarded, "UDP forwarding interrupted");
                tokio::time::sleep(UDP_RETRY_BACKOFF).await;
            }
        }
    }
}

async fn copy_datagrams(
    from: &UdpSocket,
    to: &mut BackendLink,
    forwarded: &mut u64,
) -> RelayError {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        if to.is_closed() {
            return RelayError::Closed;
        }

        let len = tokio::select! {
            biased;
            changed = to.closed.changed() => {
                if changed.is_err() {
                    return RelayError::Closed;
                }
                continue;
            }
            received = from.recv_from(&mut buf) => match received {
                Ok((len, _peer)) => len,
                Err(e) => return e.into(),
            },
        };

        // A datagram read just as the backend was swapped belongs to the
        // next generation's forwarder, not to the closed socket.
        if to.is_closed() {
            return RelayError::Closed;
        }

        if let Err(e) = to.socket.send(&buf[..len]).await {
            return e.into();
        }
        *forwarded += len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::proxy::TokioDialer;

    /// Dialer whose first UDP dial is refused; later dials go through tokio.
    #[derive(Default)]
    struct FirstDialFails {
        attempts: Mutex<Vec<String>>,
        connected: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for FirstDialFails {
        async fn dial_tcp(&self, _addr: &str, _timeout: Duration) -> io::Result<TcpStream> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        async fn dial_udp(&self, addr: &str) -> io::Result<UdpSocket> {
            let first = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(addr.to_string());
                attempts.len() == 1
            };
            if first {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }

            let socket = TokioDialer.dial_udp(addr).await?;
            self.connected.fetch_add(1, Ordering::SeqCst);
            Ok(socket)
        }
    }

    async fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (socket, _peer) = socket_pair().await;
        let backend = UdpBackend::new(socket, "127.0.0.1:9".to_string());
        let link = backend.link();

        assert!(!link.is_closed());
        assert!(backend.close());
        assert!(!backend.close());
        assert!(backend.is_closed());
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_forwarder_relays_then_exits_on_close() {
        let client_facing = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (backend_socket, receiver) = socket_pair().await;
        let backend = UdpBackend::new(backend_socket, receiver.local_addr().unwrap().to_string());

        let handle = tokio::spawn(forward_udp(Arc::clone(&client_facing), backend.link()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"hello", client_facing.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        backend.close();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder should exit after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_backend_stops_forwarder() {
        let client_facing = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (backend_socket, _receiver) = socket_pair().await;
        let backend = UdpBackend::new(backend_socket, "peer".to_string());

        let handle = tokio::spawn(forward_udp(client_facing, backend.link()));
        drop(backend);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder should exit once the backend is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_dial_still_advances_and_late_client_is_attached() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec![
            a.local_addr().unwrap().to_string(),
            b.local_addr().unwrap().to_string(),
        ];

        let dialer = Arc::new(FirstDialFails::default());
        let (targets_tx, targets_rx) = mpsc::channel(1);
        let (clients_tx, clients_rx) = mpsc::channel(1);
        let dispatcher = UdpDispatcher::new(dialer.clone());
        tokio::spawn(dispatcher.run(targets_rx, clients_rx));

        // Dialing `a` fails, so the second update moves on to `b`.
        let targets = ResolvedTargetSet::new(addrs.clone());
        targets_tx.send(targets.clone()).await.unwrap();
        targets_tx.send(targets).await.unwrap();

        timeout(Duration::from_secs(1), async {
            while dialer.connected.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second update should dial the next target");
        assert_eq!(*dialer.attempts.lock().unwrap(), addrs);

        // The client socket shows up only after the backend exists.
        let client_facing = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        clients_tx.send(Arc::clone(&client_facing)).await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"late", client_facing.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), b.recv(&mut buf))
            .await
            .expect("datagram should reach the second target")
            .unwrap();
        assert_eq!(&buf[..n], b"late");
        assert!(timeout(Duration::from_millis(100), a.recv(&mut buf))
            .await
            .is_err());
    }
}
