//! TCP dispatcher and session forwarder.
//!
//! The dispatcher is a single control loop that owns the round-robin state.
//! It reacts to two event sources in arrival order:
//!
//! - a new target set from the resolver, which replaces the current one;
//! - an accepted connection, which is either closed (no target known) or
//!   handed to a freshly spawned session together with the next backend.
//!
//! Sessions are fire and forget. Nothing tracks them after the spawn.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use super::dialer::Dialer;
use super::dispatch::DispatchState;
use crate::target::ResolvedTargetSet;

/// Copy buffer size per relay direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Routes accepted TCP connections to backends, round robin.
pub struct TcpDispatcher {
    dialer: Arc<dyn Dialer>,
    connect_timeout: Duration,
    state: DispatchState,
}

impl TcpDispatcher {
    pub fn new(dialer: Arc<dyn Dialer>, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            connect_timeout,
            state: DispatchState::new(),
        }
    }

    /// Run the control loop until the connection source closes.
    ///
    /// The resolver may finish first (static targets); the last set it
    /// delivered stays in effect.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ResolvedTargetSet>,
        mut connections: mpsc::Receiver<TcpStream>,
    ) {
        let mut updates_open = true;

        loop {
            tokio::select! {
                update = updates.recv(), if updates_open => match update {
                    Some(targets) => self.apply(targets),
                    None => {
                        debug!(
                            targets = %self.state.targets(),
                            "Resolver finished; keeping current targets"
                        );
                        updates_open = false;
                    }
                },
                accepted = connections.recv() => match accepted {
                    Some(inbound) => self.dispatch(inbound),
                    None => {
                        info!("Connection source closed; TCP dispatcher stopping");
                        return;
                    }
                },
            }
        }
    }

    fn apply(&mut self, targets: ResolvedTargetSet) {
        debug!(targets = %targets, cursor = self.state.cursor(), "TCP targets replaced");
        self.state.replace_targets(targets);
    }

    fn dispatch(&mut self, inbound: TcpStream) {
        let peer = inbound.peer_addr().ok();

        let Some(backend) = self.state.next_target() else {
            debug!(peer_addr = ?peer, "Don't know where to connect, closing incoming connection");
            drop(inbound);
            return;
        };

        let span = tracing::debug_span!("session", peer = ?peer, backend = %backend);
        tokio::spawn(
            forward_tcp(
                Arc::clone(&self.dialer),
                inbound,
                backend,
                self.connect_timeout,
            )
            .instrument(span),
        );
    }
}

/// Relay one inbound connection to `backend` until either side is done.
///
/// A failed dial drops the inbound connection. Once connected, both
/// directions are copied concurrently; the first one to end (EOF or error)
/// closes both sockets, which ends the other direction as well.
pub async fn forward_tcp(
    dialer: Arc<dyn Dialer>,
    inbound: TcpStream,
    backend: String,
    connect_timeout: Duration,
) {
    debug!("Accepted connection");

    let outbound = match dialer.dial_tcp(&backend, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(backend_addr = %backend, error = %e, "Connection to backend failed");
            return;
        }
    };

    let (mut inbound_read, mut inbound_write) = inbound.into_split();
    let (mut outbound_read, mut outbound_write) = outbound.into_split();
    let mut to_backend = 0u64;
    let mut from_backend = 0u64;

    let (finished, result) = tokio::select! {
        result = relay(&mut inbound_read, &mut outbound_write, &mut to_backend) => {
            ("incoming", result)
        }
        result = relay(&mut outbound_read, &mut inbound_write, &mut from_backend) => {
            ("outgoing", result)
        }
    };

    // Dropping every half closes both sockets.
    drop((inbound_read, inbound_write, outbound_read, outbound_write));

    debug!(
        finished,
        error = ?result.err(),
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "TCP session closed"
    );
}

/// Copy `reader` into `writer` until EOF or error, counting bytes.
async fn relay<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
