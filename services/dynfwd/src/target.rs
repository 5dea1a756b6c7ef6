//! Backend target specifications and resolved target sets.
//!
//! A [`TargetSpec`] is what the operator typed on the command line. A
//! [`ResolvedTargetSet`] is what the resolver produced from those specs on a
//! given tick: an ordered list of concrete `host:port` strings.

use std::fmt;
use std::net::IpAddr;

use hickory_proto::rr::Name;

use crate::config::ConfigError;

/// Address used for specs that carry only a port (`:8080`).
const LOCAL_HOST: &str = "127.0.0.1";

/// A configured backend descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    host: Option<String>,
    port: Option<u16>,
    requires_resolution: bool,
}

impl TargetSpec {
    /// Parse a target from `host:port`, `[v6]:port` or `:port`.
    ///
    /// In SRV mode a bare service name without a port is accepted as well;
    /// the port then comes from the SRV answer.
    pub fn parse(raw: &str, srv_mode: bool) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }

        let invalid = |reason: &str| ConfigError::InvalidTarget {
            target: raw.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated `[`"))?;
            let port = match tail {
                "" => None,
                _ => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid("expected `:port` after `]`"))?,
                ),
            };
            if host.parse::<IpAddr>().is_err() {
                return Err(invalid("brackets are only valid around an IPv6 literal"));
            }
            (host, port)
        } else {
            match raw.matches(':').count() {
                0 => (raw, None),
                1 => {
                    let (host, port) = raw.split_once(':').unwrap_or((raw, ""));
                    (host, Some(port))
                }
                _ => return Err(invalid("IPv6 literals must be enclosed in brackets")),
            }
        };

        let port = port
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| invalid(&format!("invalid port `{p}`")))
            })
            .transpose()?;

        let host = (!host.is_empty()).then(|| host.to_string());
        let requires_resolution = match &host {
            None => false,
            Some(h) => h.parse::<IpAddr>().is_err(),
        };

        if let Some(name) = host.as_deref().filter(|_| requires_resolution) {
            Name::from_ascii(name).map_err(|e| invalid(&format!("invalid hostname: {e}")))?;
        }

        if port.is_none() && !(requires_resolution && srv_mode) {
            return Err(invalid("missing port"));
        }

        Ok(Self {
            host,
            port,
            requires_resolution,
        })
    }

    /// Host part as configured, `None` when only a port was given.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Configured port. In SRV mode the answer's port is used instead.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether this target needs a DNS lookup to produce an address.
    pub fn requires_resolution(&self) -> bool {
        self.requires_resolution
    }

    /// Concrete address for a target that needs no lookup.
    pub fn literal_address(&self) -> Option<String> {
        if self.requires_resolution {
            return None;
        }
        let port = self.port?;
        let host = self.host.as_deref().unwrap_or(LOCAL_HOST);
        Some(format_address(host, port))
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.as_deref().unwrap_or("");
        match self.port {
            Some(port) => f.write_str(&format_address(host, port)),
            None => f.write_str(host),
        }
    }
}

/// Join a host and port, bracketing IPv6 literals.
pub fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Ordered list of concrete backend addresses.
///
/// Order is significant: round robin walks it by index. Change detection uses
/// [`ResolvedTargetSet::signature`], which ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTargetSet(Vec<String>);

impl ResolvedTargetSet {
    pub fn new(addresses: Vec<String>) -> Self {
        Self(addresses)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Address at `cursor mod len`, or `None` for an empty set.
    pub fn select(&self, cursor: usize) -> Option<&str> {
        if self.0.is_empty() {
            return None;
        }
        Some(&self.0[cursor % self.0.len()])
    }

    /// Order-insensitive fingerprint used to decide whether to emit.
    pub fn signature(&self) -> Signature {
        let mut sorted = self.0.clone();
        sorted.sort();
        Signature(sorted)
    }
}

impl fmt::Display for ResolvedTargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&self.0.join(", "))
        }
    }
}

/// Sorted copy of a target set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature(Vec<String>);
