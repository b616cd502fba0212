//! Address wire forms and the HostMessage binary codec.
//!
//! Addresses travel as fixed-width big-endian integers: an IPv4 address is a
//! single `u32`, an IPv6 address is a pair of `u64` halves. An IPv4-mapped
//! IPv6 address (`::ffff:a.b.c.d`) is normalized to the IPv4 form on ingest,
//! so a given socket address has exactly one wire representation.
//!
//! `HostMessage` is the payload carried inside the opaque `data` field of a
//! signaling message. The encoding is length-prefixed and deterministic:
//! identical messages encode to identical bytes, and `decode(encode(m)) == m`
//! for every representable message, including ones with empty address lists.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while decoding (or encoding) wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the announced structure was complete.
    #[error("unexpected end of buffer (needed {needed} more bytes)")]
    UnexpectedEof { needed: usize },
    /// The message type byte is not a known `HostMessageKind`.
    #[error("unknown host message type {0}")]
    UnknownMessageType(u8),
    /// The hostname field is not valid UTF-8.
    #[error("hostname is not valid UTF-8")]
    InvalidHostname(#[from] std::str::Utf8Error),
    /// Bytes remained after the last field was consumed.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    /// A length-prefixed field exceeds the u16 length prefix.
    #[error("field too long for wire format ({0} entries/bytes)")]
    FieldTooLong(usize),
}

// ---------------------------------------------------------------------------
// Address wire forms
// ---------------------------------------------------------------------------

/// Interpret a raw IP byte buffer as a `u32`.
///
/// A 16-byte buffer yields the last four bytes (the IPv4-mapped tail);
/// anything else is read as a big-endian IPv4 quad.
pub fn ip_to_u32(ip: &[u8]) -> u32 {
    if ip.len() == 16 {
        u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]])
    } else {
        u32::from_be_bytes([ip[0], ip[1], ip[2], ip[3]])
    }
}

/// An IPv4 endpoint in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4AddrWire {
    pub ip: u32,
    pub port: u32,
}

impl Ipv4AddrWire {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Ipv4AddrWire {
            ip: u32::from_be_bytes(ip.octets()),
            port: u32::from(port),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip(), self.port as u16))
    }
}

impl fmt::Display for Ipv4AddrWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// An IPv6 endpoint in wire form: `hi` is the big-endian interpretation of
/// the first eight address bytes, `lo` of the last eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv6AddrWire {
    pub hi: u64,
    pub lo: u64,
    pub port: u32,
}

impl Ipv6AddrWire {
    pub fn new(ip: Ipv6Addr, port: u16) -> Self {
        let o = ip.octets();
        Ipv6AddrWire {
            hi: u64::from_be_bytes([o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]]),
            lo: u64::from_be_bytes([o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]]),
            port: u32::from(port),
        }
    }

    pub fn ip(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o[..8].copy_from_slice(&self.hi.to_be_bytes());
        o[8..].copy_from_slice(&self.lo.to_be_bytes());
        Ipv6Addr::from(o)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip(), self.port as u16))
    }

    /// The IPv4 wire form of an IPv4-mapped address, if this is one.
    /// Ingest paths use this to keep mapped addresses out of the v6 caches.
    pub fn to_v4(&self) -> Option<Ipv4AddrWire> {
        self.ip().to_ipv4_mapped().map(|v4| Ipv4AddrWire {
            ip: u32::from_be_bytes(v4.octets()),
            port: self.port,
        })
    }
}

impl fmt::Display for Ipv6AddrWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Either wire form, produced by normalizing an arbitrary IP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrWire {
    V4(Ipv4AddrWire),
    V6(Ipv6AddrWire),
}

impl AddrWire {
    /// Convert an IP endpoint to its canonical wire form. An IPv4-mapped
    /// IPv6 address becomes the IPv4 form.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => AddrWire::V4(Ipv4AddrWire::new(v4, port)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => AddrWire::V4(Ipv4AddrWire::new(v4, port)),
                None => AddrWire::V6(Ipv6AddrWire::new(v6, port)),
            },
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        AddrWire::from_ip(addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            AddrWire::V4(a) => a.socket_addr(),
            AddrWire::V6(a) => a.socket_addr(),
        }
    }
}

// ---------------------------------------------------------------------------
// HostMessage
// ---------------------------------------------------------------------------

/// Discriminant of a `HostMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMessageKind {
    None,
    HostQuery,
    HostQueryReply,
    HostUpdateNotification,
    HostMovedNotification,
    HostPunchNotification,
    HostOnlineNotification,
    HostRegister,
}

impl HostMessageKind {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => HostMessageKind::None,
            1 => HostMessageKind::HostQuery,
            2 => HostMessageKind::HostQueryReply,
            3 => HostMessageKind::HostUpdateNotification,
            4 => HostMessageKind::HostMovedNotification,
            5 => HostMessageKind::HostPunchNotification,
            6 => HostMessageKind::HostOnlineNotification,
            7 => HostMessageKind::HostRegister,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            HostMessageKind::None => 0,
            HostMessageKind::HostQuery => 1,
            HostMessageKind::HostQueryReply => 2,
            HostMessageKind::HostUpdateNotification => 3,
            HostMessageKind::HostMovedNotification => 4,
            HostMessageKind::HostPunchNotification => 5,
            HostMessageKind::HostOnlineNotification => 6,
            HostMessageKind::HostRegister => 7,
        }
    }
}

/// The binary payload exchanged between registry and clients.
///
/// Layout (all integers big-endian):
///
/// ```text
/// u8   kind
/// u16  hostname length, then that many UTF-8 bytes
/// u16  v4 count, then count * (u32 ip, u32 port)
/// u16  v6 count, then count * (u64 hi, u64 lo, u32 port)
/// u8   external flag, then (u32 ip, u32 port) if the flag is 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMessage {
    pub kind: HostMessageKind,
    pub hostname: String,
    pub v4: Vec<Ipv4AddrWire>,
    pub v6: Vec<Ipv6AddrWire>,
    pub external: Option<Ipv4AddrWire>,
}

impl HostMessage {
    pub fn new(kind: HostMessageKind, hostname: impl Into<String>) -> Self {
        HostMessage {
            kind,
            hostname: hostname.into(),
            v4: Vec::new(),
            v6: Vec::new(),
            external: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.hostname.len() > usize::from(u16::MAX) {
            return Err(WireError::FieldTooLong(self.hostname.len()));
        }
        if self.v4.len() > usize::from(u16::MAX) {
            return Err(WireError::FieldTooLong(self.v4.len()));
        }
        if self.v6.len() > usize::from(u16::MAX) {
            return Err(WireError::FieldTooLong(self.v6.len()));
        }

        let mut buf = Vec::with_capacity(
            1 + 2 + self.hostname.len() + 2 + self.v4.len() * 8 + 2 + self.v6.len() * 20 + 9,
        );
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&(self.hostname.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.hostname.as_bytes());

        buf.extend_from_slice(&(self.v4.len() as u16).to_be_bytes());
        for a in &self.v4 {
            buf.extend_from_slice(&a.ip.to_be_bytes());
            buf.extend_from_slice(&a.port.to_be_bytes());
        }

        buf.extend_from_slice(&(self.v6.len() as u16).to_be_bytes());
        for a in &self.v6 {
            buf.extend_from_slice(&a.hi.to_be_bytes());
            buf.extend_from_slice(&a.lo.to_be_bytes());
            buf.extend_from_slice(&a.port.to_be_bytes());
        }

        match self.external {
            Some(a) => {
                buf.push(1);
                buf.extend_from_slice(&a.ip.to_be_bytes());
                buf.extend_from_slice(&a.port.to_be_bytes());
            }
            None => buf.push(0),
        }

        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);

        let kind = HostMessageKind::from_u8(r.u8()?)?;
        let name_len = usize::from(r.u16()?);
        let hostname = std::str::from_utf8(r.bytes(name_len)?)?.to_owned();

        let v4_count = usize::from(r.u16()?);
        let mut v4 = Vec::with_capacity(v4_count);
        for _ in 0..v4_count {
            v4.push(Ipv4AddrWire {
                ip: r.u32()?,
                port: r.u32()?,
            });
        }

        let v6_count = usize::from(r.u16()?);
        let mut v6 = Vec::with_capacity(v6_count);
        for _ in 0..v6_count {
            v6.push(Ipv6AddrWire {
                hi: r.u64()?,
                lo: r.u64()?,
                port: r.u32()?,
            });
        }

        let external = match r.u8()? {
            0 => None,
            _ => Some(Ipv4AddrWire {
                ip: r.u32()?,
                port: r.u32()?,
            }),
        };

        if r.remaining() != 0 {
            return Err(WireError::TrailingBytes(r.remaining()));
        }

        Ok(HostMessage {
            kind,
            hostname,
            v4,
            v6,
            external,
        })
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
