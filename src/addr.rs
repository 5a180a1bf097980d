//! Dual-family endpoint values with SOCKS5 wire encoding.

use crate::socks::consts::{SOCKS5_ATYPE_IPV4, SOCKS5_ATYPE_IPV6};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// An IPv4 or IPv6 endpoint as it appears in SOCKS5 BND/DST fields.
///
/// Never mutated once stored in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    /// Build from raw IPv4 octets and a port.
    pub fn from_ipv4(octets: [u8; 4], port: u16) -> Self {
        Address {
            ip: IpAddr::V4(Ipv4Addr::from(octets)),
            port,
        }
    }

    /// Build from raw IPv6 octets and a port.
    pub fn from_ipv6(octets: [u8; 16], port: u16) -> Self {
        Address {
            ip: IpAddr::V6(Ipv6Addr::from(octets)),
            port,
        }
    }

    /// The all-zero IPv4 address with port 0, used in failure replies.
    pub fn unspecified() -> Self {
        Address {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    /// The IP component.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// SOCKS5 address type byte for this family.
    pub fn atype(&self) -> u8 {
        match self.ip {
            IpAddr::V4(_) => SOCKS5_ATYPE_IPV4,
            IpAddr::V6(_) => SOCKS5_ATYPE_IPV6,
        }
    }

    /// True when the IP is all zeroes.
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// Compare IP bytes only, ignoring the port.
    pub fn equal_ip(&self, other: &Address) -> bool {
        self.ip == other.ip
    }

    /// Convert to a socket address for connect/sendto.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Append the wire form (ATYPE, IP bytes, big-endian port) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.atype());
        match self.ip {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Decode the IP-bytes + port tail for a known family.
    ///
    /// Returns the address and the number of bytes consumed, or `None`
    /// when `buf` is too short.
    pub fn decode(atype: u8, buf: &[u8]) -> Option<(Address, usize)> {
        match atype {
            SOCKS5_ATYPE_IPV4 => {
                if buf.len() < 4 + 2 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[..4]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Some((Address::from_ipv4(octets, port), 6))
            }
            SOCKS5_ATYPE_IPV6 => {
                if buf.len() < 16 + 2 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Some((Address::from_ipv6(octets, port), 18))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
