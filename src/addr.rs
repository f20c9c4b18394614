//! Network addresses and peer identity.
//!
//! [`NetAddr`] is the address type used throughout the library: an IPv4
//! address plus a TCP port. It doubles as the *identity* of a peer on the
//! overlay: under [`IdentityMode::IpBased`](crate::config::IdentityMode)
//! the port component of an identity is forced to zero so that every
//! socket from the same host collapses onto one peer.

use {
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        net::{Ipv4Addr, SocketAddr, SocketAddrV4},
        str::FromStr,
    },
};

/// An IPv4 endpoint `(ip, port)`.
///
/// Unlike [`SocketAddr`] this type is `Copy`, hashable, and restricted to
/// IPv4, which is what the overlay's identity logic assumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddr {
    /// IPv4 address.
    pub ip: Ipv4Addr,
    /// TCP port. Zero when the address is an `IpBased` identity.
    pub port: u16,
}

impl NetAddr {
    /// Create an address from its parts.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The same address with the port zeroed, the `IpBased` identity form.
    pub fn ip_only(&self) -> Self {
        Self::new(self.ip, 0)
    }

    /// Convert to a [`SocketAddr`] for use with the socket API.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for NetAddr {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Self::from(v4),
            // Listeners are v4-only; a mapped v6 peer address can still
            // show up behind dual-stack resolvers.
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Self::new(ip, v6.port()),
                None => Self::new(Ipv4Addr::UNSPECIFIED, v6.port()),
            },
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for NetAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddrV4::from_str(s).map(Self::from)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: NetAddr = "127.0.0.1:12345".parse().unwrap();
        assert_eq!(addr.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port, 12345);
        assert_eq!(addr.to_string(), "127.0.0.1:12345");
    }

    #[test]
    fn test_ip_only_identity() {
        let addr: NetAddr = "10.0.0.7:9000".parse().unwrap();
        let id = addr.ip_only();
        assert_eq!(id.port, 0);
        assert_eq!(id.ip, addr.ip);
        assert_ne!(id, addr);
        assert_eq!(id, addr.ip_only());
    }

    #[test]
    fn test_socket_addr_roundtrip() {
        let addr: NetAddr = "192.168.1.2:4242".parse().unwrap();
        let sa = addr.socket_addr();
        assert_eq!(NetAddr::from(sa), addr);
    }
}
