//! SOCKS5 wire codec.
//!
//! Pure parse/serialize for the method-selection message, the command
//! request, replies, the RFC 1929 sub-negotiation message, and the UDP
//! datagram header. Parsers work over the session ingress queue and
//! report "need more bytes" as `Ok(None)`; nothing is consumed until a
//! complete message is present.

use crate::addr::Address;
use crate::buffer::ByteQueue;
use crate::error::SessionError;
use crate::socks::consts::*;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

/// Destination field of a command or UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    /// IPv4 or IPv6 endpoint
    Ip(Address),
    /// Domain name with port; accepted on the wire, rejected by the engine
    Domain(String, u16),
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestAddr::Ip(addr) => write!(f, "{}", addr),
            DestAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// A parsed SOCKS5 command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Raw command byte (CONNECT, UDP ASSOCIATE, or anything else)
    pub cmd: u8,
    /// Requested destination
    pub dest: DestAddr,
}

/// Parse the method-selection message `VER NMETHODS METHODS[..]`.
///
/// Returns the offered method set and the number of bytes to consume.
pub fn parse_method_selection(
    input: &ByteQueue,
) -> Result<Option<(BTreeSet<u8>, usize)>, SessionError> {
    let buf = input.peek();
    if buf.len() < 3 {
        return Ok(None);
    }
    if buf[0] != SOCKS5_VERSION {
        return Err(SessionError::BadVersion(buf[0]));
    }
    let count = buf[1] as usize;
    if count == 0 || count > MAX_METHODS {
        return Err(SessionError::BadMethodCount(buf[1]));
    }
    if buf.len() < 2 + count {
        return Ok(None);
    }
    let methods = buf[2..2 + count].iter().copied().collect();
    Ok(Some((methods, 2 + count)))
}

/// The two-byte method-selection reply.
pub fn encode_method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Parse a command request `VER CMD RSV ATYPE DST.ADDR DST.PORT`.
///
/// Returns the command and the number of bytes to consume.
pub fn parse_command(input: &ByteQueue) -> Result<Option<(Command, usize)>, SessionError> {
    let buf = input.peek();
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != SOCKS5_VERSION {
        return Err(SessionError::BadVersion(buf[0]));
    }
    let cmd = buf[1];
    let atype = buf[3];

    match atype {
        SOCKS5_ATYPE_IPV4 | SOCKS5_ATYPE_IPV6 => match Address::decode(atype, &buf[4..]) {
            Some((addr, used)) => Ok(Some((
                Command {
                    cmd,
                    dest: DestAddr::Ip(addr),
                },
                4 + used,
            ))),
            None => Ok(None),
        },
        SOCKS5_ATYPE_DOMAIN => {
            if buf.len() < 5 {
                return Ok(None);
            }
            let name_len = buf[4] as usize;
            if buf.len() < 5 + name_len + 2 {
                return Ok(None);
            }
            let name = String::from_utf8_lossy(&buf[5..5 + name_len]).into_owned();
            let port = u16::from_be_bytes([buf[5 + name_len], buf[5 + name_len + 1]]);
            Ok(Some((
                Command {
                    cmd,
                    dest: DestAddr::Domain(name, port),
                },
                5 + name_len + 2,
            )))
        }
        other => Err(SessionError::BadAtype(other)),
    }
}

/// Encode a reply `VER REP RSV ATYPE BND.ADDR BND.PORT`.
pub fn encode_reply(rep: u8, bnd: &Address) -> Vec<u8> {
    let mut out = vec![SOCKS5_VERSION, rep, SOCKS5_RESERVED];
    bnd.encode_into(&mut out);
    out
}

/// Parse the RFC 1929 message `VER ULEN UNAME PLEN PASSWD`.
///
/// Returns the credentials and the number of bytes to consume.
pub fn parse_userpass(
    input: &ByteQueue,
) -> Result<Option<(String, String, usize)>, SessionError> {
    let buf = input.peek();
    // version + ulen + at least one byte each of username, plen, password
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] != SOCKS5_AUTH_VERSION {
        return Err(SessionError::BadAuthVersion(buf[0]));
    }
    let ulen = buf[1] as usize;
    if buf.len() < 2 + ulen + 1 {
        return Ok(None);
    }
    let plen = buf[2 + ulen] as usize;
    let total = 2 + ulen + 1 + plen;
    if buf.len() < total {
        return Ok(None);
    }
    let username = String::from_utf8_lossy(&buf[2..2 + ulen]).into_owned();
    let password = String::from_utf8_lossy(&buf[2 + ulen + 1..total]).into_owned();
    Ok(Some((username, password, total)))
}

/// A decoded SOCKS5 UDP datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    /// Destination carried in the header
    pub dest: DestAddr,
    /// Payload following the header
    pub payload: &'a [u8],
}

/// Parse a UDP datagram `RSV(2) FRAG ATYPE DST.ADDR DST.PORT DATA`.
pub fn parse_udp_datagram(buf: &[u8]) -> Result<UdpDatagram<'_>, SessionError> {
    if buf.len() < 4 + 2 + 2 {
        return Err(SessionError::BadPacket("datagram too short"));
    }
    if buf[0] != 0 || buf[1] != 0 {
        return Err(SessionError::BadPacket("nonzero RSV field"));
    }
    if buf[2] != 0 {
        return Err(SessionError::BadPacket("fragmentation unsupported"));
    }
    let atype = buf[3];
    match atype {
        SOCKS5_ATYPE_IPV4 | SOCKS5_ATYPE_IPV6 => {
            let (addr, used) = Address::decode(atype, &buf[4..])
                .ok_or(SessionError::BadPacket("truncated destination"))?;
            Ok(UdpDatagram {
                dest: DestAddr::Ip(addr),
                payload: &buf[4 + used..],
            })
        }
        SOCKS5_ATYPE_DOMAIN => {
            let name_len = buf[4] as usize;
            if buf.len() < 5 + name_len + 2 {
                return Err(SessionError::BadPacket("truncated destination"));
            }
            let name = String::from_utf8_lossy(&buf[5..5 + name_len]).into_owned();
            let port = u16::from_be_bytes([buf[5 + name_len], buf[5 + name_len + 1]]);
            Ok(UdpDatagram {
                dest: DestAddr::Domain(name, port),
                payload: &buf[5 + name_len + 2..],
            })
        }
        _ => Err(SessionError::BadPacket("bad address type")),
    }
}

/// Wrap a payload in a UDP datagram header naming its source.
pub fn encode_udp_datagram(from: &Address, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + 18 + payload.len());
    out.put_u16(0);
    out.put_u8(0);
    let mut addr = Vec::with_capacity(19);
    from.encode_into(&mut addr);
    out.extend_from_slice(&addr);
    out.extend_from_slice(payload);
    out.freeze()
}
