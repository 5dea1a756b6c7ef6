//! Target resolution loop.
//!
//! The resolver turns configured [`TargetSpec`]s into a [`ResolvedTargetSet`]
//! and hands every *changed* set to the dispatcher over a single-slot channel.
//!
//! - Targets that need no lookup are resolved once; the loop then exits
//!   without ever touching DNS.
//! - Otherwise DNS is queried on every tick (the first tick fires
//!   immediately). Any lookup failure abandons the tick, so the previously
//!   emitted set stays authoritative.
//! - Change detection compares sorted copies, so a DNS server rotating its
//!   answer order does not cause churn. The emitted set keeps resolution order.
//! - Sending blocks until the dispatcher has taken the previous set, so no
//!   update is ever dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ResolutionMode;
use crate::dns::{DnsClient, DnsError};
use crate::target::{format_address, ResolvedTargetSet, Signature, TargetSpec};

/// Remembers the signature of the last emitted set.
///
/// Starts out equal to the empty set, which the dispatcher already assumes,
/// so an initial resolution with no records emits nothing.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Signature,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `set` and report whether it differs from the previous one.
    pub fn observe(&mut self, set: &ResolvedTargetSet) -> bool {
        let signature = set.signature();
        if signature == self.last {
            return false;
        }
        self.last = signature;
        true
    }
}

/// Periodically resolves targets and emits changes.
pub struct Resolver {
    specs: Vec<TargetSpec>,
    mode: ResolutionMode,
    poll_interval: Duration,
    dns: Option<Arc<dyn DnsClient>>,
}

impl Resolver {
    pub fn new(specs: Vec<TargetSpec>, mode: ResolutionMode, poll_interval: Duration) -> Self {
        Self {
            specs,
            mode,
            poll_interval,
            dns: None,
        }
    }

    /// Use `dns` for targets that need a lookup.
    pub fn with_dns(mut self, dns: Arc<dyn DnsClient>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Whether any configured target needs a DNS lookup.
    pub fn needs_dns(&self) -> bool {
        self.specs.iter().any(TargetSpec::requires_resolution)
    }

    /// Run until the receiving side of `updates` goes away.
    ///
    /// Returns right after the single emission when no target needs DNS.
    pub async fn run(self, updates: mpsc::Sender<ResolvedTargetSet>) -> Result<()> {
        if !self.needs_dns() {
            let targets = self.literal_targets();
            info!(targets = %targets, "No target needs DNS; resolved once");
            if updates.send(targets).await.is_err() {
                debug!("Dispatcher gone before the static targets were delivered");
            }
            return Ok(());
        }

        let dns = self
            .dns
            .clone()
            .context("targets need DNS but no DNS client was configured")?;

        let mut detector = ChangeDetector::new();
        let mut current = ResolvedTargetSet::empty();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = ?self.poll_interval,
            mode = ?self.mode,
            target_count = self.specs.len(),
            "Starting DNS refresh loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = updates.closed() => {
                    debug!("Dispatcher gone; stopping DNS refresh loop");
                    return Ok(());
                }
            }

            let Some(resolved) = self.resolve_once(dns.as_ref()).await else {
                continue;
            };

            if !detector.observe(&resolved) {
                debug!(targets = %resolved, "Connect targets unchanged");
                continue;
            }

            info!(old = %current, new = %resolved, "Connect targets changed");
            current = resolved.clone();
            if updates.send(resolved).await.is_err() {
                debug!("Dispatcher gone; stopping DNS refresh loop");
                return Ok(());
            }
        }
    }

    /// Concatenation of the literal targets in configured order.
    fn literal_targets(&self) -> ResolvedTargetSet {
        ResolvedTargetSet::new(
            self.specs
                .iter()
                .filter_map(TargetSpec::literal_address)
                .collect(),
        )
    }

    /// Resolve every target once.
    ///
    /// Returns `None` if any lookup failed; the caller keeps its previous set.
    pub async fn resolve_once(&self, dns: &dyn DnsClient) -> Option<ResolvedTargetSet> {
        let mut addresses = Vec::new();

        for spec in &self.specs {
            let host = match spec.host() {
                Some(host) if spec.requires_resolution() => host,
                _ => {
                    addresses.extend(spec.literal_address());
                    continue;
                }
            };

            let result = match (self.mode, spec.port()) {
                (ResolutionMode::A, Some(port)) => resolve_a(dns, host, port).await,
                (ResolutionMode::A, None) => {
                    warn!(host, "Target has no port; skipping");
                    continue;
                }
                (ResolutionMode::Srv, _) => resolve_srv(dns, host).await,
            };

            match result {
                Ok(found) => {
                    if found.is_empty() {
                        info!(host, mode = ?self.mode, "DNS response has no usable records");
                    }
                    addresses.extend(found);
                }
                Err(e) => {
                    warn!(host, error = %e, "Error resolving target; keeping previous targets");
                    return None;
                }
            }
        }

        Some(ResolvedTargetSet::new(addresses))
    }
}

async fn resolve_a(dns: &dyn DnsClient, host: &str, port: u16) -> Result<Vec<String>, DnsError> {
    let ips = dns.lookup_a(host).await?;
    let addresses: Vec<String> = ips
        .iter()
        .map(|ip| format_address(&ip.to_string(), port))
        .collect();
    debug!(host, resolved = ?addresses, "Resolved A records");
    Ok(addresses)
}

/// SRV then A. The result only covers the SRV targets this particular answer
/// listed; servers that truncate or rotate large SRV sets make round robin
/// run over a different subset on each refresh. That is a property of the
/// records served, not something to paper over here.
async fn resolve_srv(dns: &dyn DnsClient, host: &str) -> Result<Vec<String>, DnsError> {
    let records = dns.lookup_srv(host).await?;
    let mut addresses = Vec::new();

    for record in records {
        let ips = dns.lookup_a(&record.target).await?;
        if ips.is_empty() {
            debug!(host, srv_target = %record.target, "SRV target has no A records");
        }
        addresses.extend(
            ips.iter()
                .map(|ip| format_address(&ip.to_string(), record.port)),
        );
    }

    debug!(host, resolved = ?addresses, "Resolved SRV records");
    Ok(addresses)
}
