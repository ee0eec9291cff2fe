//! Endpoint value type (spec component A).
//!
//! A thin, `Copy`-able wrapper around [`std::net::SocketAddr`]. Kept as a
//! distinct type (rather than using `SocketAddr` directly everywhere) so the
//! socket/resolver/TLS modules have one place to hang conversions and so a
//! future non-`std` address representation would not be a breaking change to
//! every call site, matching how the original library keeps `endpoint` and
//! `endpoint_convert.hpp` as their own small layer over the platform address
//! structures.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::Error;

/// An IP address plus port, irrespective of v4/v6 family.
///
/// spec.md's non-goal is IPv6-*optimization*, not IPv6 support: a v6
/// `Endpoint` is just as valid as a v4 one everywhere in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(addr, port))
    }

    pub fn v4(addr: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(IpAddr::V4(addr), port))
    }

    pub fn v6(addr: Ipv6Addr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(IpAddr::V6(addr), port))
    }

    /// The "unspecified" endpoint for binding a server that should listen on
    /// all interfaces for the given family.
    pub fn unspecified(port: u16, v6: bool) -> Endpoint {
        if v6 {
            Endpoint::v6(Ipv6Addr::UNSPECIFIED, port)
        } else {
            Endpoint::v4(Ipv4Addr::UNSPECIFIED, port)
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    pub fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Parses `"host:port"` where `host` must already be a numeric literal
    /// (no DNS). Used by the resolver's `numeric_host` fast path and by
    /// tests (spec §8 S6).
    pub fn parse(s: &str) -> Result<Endpoint, Error> {
        s.parse::<SocketAddr>()
            .map(Endpoint)
            .map_err(|_| Error::invalid_argument("endpoint: not a valid numeric host:port"))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> SocketAddr {
        ep.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
