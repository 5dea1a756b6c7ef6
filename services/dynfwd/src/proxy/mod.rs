//! Connection dispatch and forwarding.
//!
//! This module provides:
//! - TCP accept loop and UDP bind
//! - Round-robin dispatch state
//! - TCP dispatcher and bidirectional session forwarder
//! - UDP dispatcher and one-way flow forwarder
//!
//! ## Architecture
//!
//! ```text
//! Listener --(connections)--> Dispatcher <--(target sets)-- Resolver
//!                                 |
//!                                 +--> Forwarder --> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use dynfwd::proxy::{connection_queue, target_handoff, Listener, TcpDispatcher, TokioDialer};
//!
//! let (targets_tx, targets_rx) = target_handoff();
//! let (conn_tx, conn_rx) = connection_queue();
//!
//! tokio::spawn(resolver.run(targets_tx));
//! tokio::spawn(listener.run(conn_tx));
//! TcpDispatcher::new(Arc::new(TokioDialer), timeout).run(targets_rx, conn_rx).await;
//! ```

mod dialer;
mod dispatch;
mod listener;
mod tcp;
mod udp;

use tokio::sync::mpsc;

use crate::target::ResolvedTargetSet;

pub use dialer::{Dialer, TokioDialer};
pub use dispatch::DispatchState;
pub use listener::{bind_udp, connection_queue, Listener, CONNECTION_QUEUE_CAPACITY};
pub use tcp::{forward_tcp, TcpDispatcher};
pub use udp::{
    forward_udp, BackendLink, RelayError, UdpBackend, UdpDispatcher, UDP_RETRY_BACKOFF,
};

/// Single-slot handoff from the resolver to a dispatcher.
///
/// The resolver's send waits until the dispatcher has taken the previous set.
/// Do not enlarge: delivery order and the absence of drops rely on it.
pub const TARGET_HANDOFF_CAPACITY: usize = 1;

/// Create the resolver to dispatcher handoff channel.
pub fn target_handoff() -> (
    mpsc::Sender<ResolvedTargetSet>,
    mpsc::Receiver<ResolvedTargetSet>,
) {
    mpsc::channel(TARGET_HANDOFF_CAPACITY)
}
