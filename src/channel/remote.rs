use crate::error::Error;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

const WILDCARD: &str = "*";

/// Host part of an address mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPattern {
    Any,
    Ip(IpAddr),
}

/// Port part of an address mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortPattern {
    Any,
    Port(u16),
}

/// The remote end of a channel.
///
/// A remote is either a concrete socket address or a mask in which the host,
/// the port, or both are `*`. Masks only make sense for inbound channels: they
/// are matched against the sender of every datagram the Listener Socket
/// receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remote {
    Address(SocketAddr),
    Mask { host: HostPattern, port: PortPattern },
}

/// How well a sender matched a remote, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MatchTier {
    Exact,
    AnyHost,
    AnyPort,
    Any,
}

impl Remote {
    /// Builds a remote from separate host and port strings, either of which
    /// may be `*`. Concrete host names are resolved.
    pub fn new(host: &str, port: &str) -> Result<Self, Error> {
        let host = host.trim();
        let port = port.trim();
        let invalid = || Error::InvalidAddress(format!("{host}:{port}"));

        let port_pattern = if port == WILDCARD {
            PortPattern::Any
        } else {
            PortPattern::Port(port.parse().map_err(|_| invalid())?)
        };

        if host == WILDCARD {
            return Ok(Remote::Mask {
                host: HostPattern::Any,
                port: port_pattern,
            });
        }

        match port_pattern {
            PortPattern::Port(port) => {
                let addr = (host, port)
                    .to_socket_addrs()
                    .map_err(|_| invalid())?
                    .next()
                    .ok_or_else(invalid)?;
                Ok(Remote::Address(addr))
            }
            PortPattern::Any => {
                let ip = (host, 0)
                    .to_socket_addrs()
                    .map_err(|_| invalid())?
                    .next()
                    .ok_or_else(invalid)?
                    .ip();
                Ok(Remote::Mask {
                    host: HostPattern::Ip(ip),
                    port: PortPattern::Any,
                })
            }
        }
    }

    /// Returns true if host or port is `*`.
    pub fn is_mask(&self) -> bool {
        matches!(self, Remote::Mask { .. })
    }

    /// The concrete address, if this is not a mask.
    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            Remote::Address(addr) => Some(*addr),
            Remote::Mask { .. } => None,
        }
    }

    pub(crate) fn match_tier(&self, sender: SocketAddr) -> Option<MatchTier> {
        match *self {
            Remote::Address(addr) => (addr == sender).then_some(MatchTier::Exact),
            Remote::Mask { host, port } => match (host, port) {
                (HostPattern::Any, PortPattern::Port(p)) => {
                    (p == sender.port()).then_some(MatchTier::AnyHost)
                }
                (HostPattern::Ip(ip), PortPattern::Any) => {
                    (ip == sender.ip()).then_some(MatchTier::AnyPort)
                }
                (HostPattern::Any, PortPattern::Any) => Some(MatchTier::Any),
                (HostPattern::Ip(ip), PortPattern::Port(p)) => {
                    (ip == sender.ip() && p == sender.port()).then_some(MatchTier::Exact)
                }
            },
        }
    }
}

impl FromStr for Remote {
    type Err = Error;

    /// Parses `host:port`, `[v6]:port`, `*:port`, `host:*` or `*:*`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Remote::new(host, port)
    }
}

impl From<SocketAddr> for Remote {
    fn from(addr: SocketAddr) -> Self {
        Remote::Address(addr)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::Address(addr) => write!(f, "{addr}"),
            Remote::Mask { host, port } => {
                match host {
                    HostPattern::Any => f.write_str(WILDCARD)?,
                    HostPattern::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]")?,
                    HostPattern::Ip(ip) => write!(f, "{ip}")?,
                }
                f.write_str(":")?;
                match port {
                    PortPattern::Any => f.write_str(WILDCARD),
                    PortPattern::Port(p) => write!(f, "{p}"),
                }
            }
        }
    }
}
