//! Minimal STUN (RFC 5389) binding support.
//!
//! Covers exactly what the coordination core consumes: Binding Request and
//! Binding Success messages, the MAPPED-ADDRESS / XOR-MAPPED-ADDRESS /
//! CHANGED-ADDRESS / OTHER-ADDRESS attributes for reflexive discovery, and
//! USERNAME for credential-gated connectivity checks between peers.
//!
//! The client prefers XOR-MAPPED-ADDRESS and falls back to MAPPED-ADDRESS,
//! matching the behavior of common public servers that still answer with the
//! classic attribute only.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Magic cookie fixed by RFC 5389.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802c;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const HEADER_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("short STUN packet ({0} bytes)")]
    ShortPacket(usize),
    #[error("bad magic cookie")]
    BadCookie,
    #[error("attribute extends past end of message")]
    BadAttributeLength,
    #[error("malformed STUN URI: {0}")]
    BadUri(String),
    #[error("could not resolve STUN server {0}")]
    Unresolvable(String),
    #[error("server answered without a usable address attribute")]
    NoAddress,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded (or under-construction) STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub kind: u16,
    pub transaction_id: [u8; 12],
    attributes: Vec<(u16, Vec<u8>)>,
}

impl StunMessage {
    /// A Binding Request with a fresh random transaction ID.
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        StunMessage {
            kind: BINDING_REQUEST,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// A Binding Success response echoing `transaction_id`.
    pub fn binding_success(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            kind: BINDING_SUCCESS,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn is_binding_request(&self) -> bool {
        self.kind == BINDING_REQUEST
    }

    pub fn is_binding_success(&self) -> bool {
        self.kind == BINDING_SUCCESS
    }

    pub fn add_username(&mut self, username: &str) {
        self.attributes
            .push((ATTR_USERNAME, username.as_bytes().to_vec()));
    }

    pub fn username(&self) -> Option<&str> {
        self.attribute(ATTR_USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.attributes.push((ATTR_XOR_MAPPED_ADDRESS, value));
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_XOR_MAPPED_ADDRESS)
            .and_then(|v| decode_xor_address(v, &self.transaction_id))
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_MAPPED_ADDRESS).and_then(decode_address)
    }

    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_CHANGED_ADDRESS).and_then(decode_address)
    }

    pub fn other_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_OTHER_ADDRESS).and_then(decode_address)
    }

    fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|(_, v)| 4 + v.len() + pad(v.len()))
            .sum();
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        buf.extend_from_slice(&self.kind.to_be_bytes());
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        for (kind, value) in &self.attributes {
            buf.extend_from_slice(&kind.to_be_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
            buf.extend_from_slice(value);
            buf.extend(std::iter::repeat(0u8).take(pad(value.len())));
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::ShortPacket(buf.len()));
        }
        let kind = u16::from_be_bytes([buf[0], buf[1]]);
        let body_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::BadCookie);
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        if buf.len() < HEADER_LEN + body_len {
            return Err(StunError::ShortPacket(buf.len()));
        }

        let mut attributes = Vec::new();
        let mut pos = HEADER_LEN;
        let end = HEADER_LEN + body_len;
        while pos + 4 <= end {
            let attr_kind = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]));
            pos += 4;
            if pos + attr_len > end {
                return Err(StunError::BadAttributeLength);
            }
            attributes.push((attr_kind, buf[pos..pos + attr_len].to_vec()));
            pos += attr_len + pad(attr_len);
        }

        Ok(StunMessage {
            kind,
            transaction_id,
            attributes,
        })
    }
}

/// Cheap check that a datagram looks like STUN before a full decode.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xc0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

fn pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn decode_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    match family {
        FAMILY_IPV4 if value.len() >= 8 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Some(SocketAddr::from((ip, port)))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(&value[4..20]);
            Some(SocketAddr::from((Ipv6Addr::from(o), port)))
        }
        _ => None,
    }
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([value[2], value[3]]) ^ u16::from_be_bytes([cookie[0], cookie[1]]);
    match family {
        FAMILY_IPV4 if value.len() >= 8 => {
            let mut o = [0u8; 4];
            for i in 0..4 {
                o[i] = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::from((Ipv4Addr::from(o), port)))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(transaction_id);
            let mut o = [0u8; 16];
            for i in 0..16 {
                o[i] = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::from((Ipv6Addr::from(o), port)))
        }
        _ => None,
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let xport = addr.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
    match addr.ip() {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            let mut value = vec![0, FAMILY_IPV4];
            value.extend_from_slice(&xport.to_be_bytes());
            for i in 0..4 {
                value.push(o[i] ^ cookie[i]);
            }
            value
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(transaction_id);
            let mut value = vec![0, FAMILY_IPV6];
            value.extend_from_slice(&xport.to_be_bytes());
            for i in 0..16 {
                value.push(o[i] ^ key[i]);
            }
            value
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Accepts `stun:host:port`, `stun://host:port`, or a bare `host:port`.
pub fn parse_stun_uri(uri: &str) -> Result<String, StunError> {
    let rest = uri
        .strip_prefix("stun://")
        .or_else(|| uri.strip_prefix("stun:"))
        .unwrap_or(uri);
    if rest.is_empty() || !rest.contains(':') {
        return Err(StunError::BadUri(uri.to_owned()));
    }
    Ok(rest.to_owned())
}

/// A UDP STUN client bound to an ephemeral local port.
///
/// The socket is dedicated to one server; requests are serialized by the
/// borrow of `&self` holding the receive loop for the matching transaction.
pub struct StunClient {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
}

impl StunClient {
    pub async fn new(uri: &str) -> Result<Self, StunError> {
        let hostport = parse_stun_uri(uri)?;
        let server = tokio::net::lookup_host(&hostport)
            .await?
            .next()
            .ok_or_else(|| StunError::Unresolvable(hostport.clone()))?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(StunClient {
            socket: Arc::new(socket),
            server,
        })
    }

    /// Reuse an existing socket, e.g. to learn the reflexive address of a
    /// candidate-gathering socket rather than of a throwaway one.
    pub fn with_socket(socket: Arc<UdpSocket>, server: SocketAddr) -> Self {
        StunClient { socket, server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn request(&self) -> Result<StunMessage, StunError> {
        let req = StunMessage::binding_request();
        self.socket.send_to(&req.encode(), self.server).await?;

        let mut buf = [0u8; 1500];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.server || !is_stun(&buf[..n]) {
                continue;
            }
            let msg = StunMessage::decode(&buf[..n])?;
            if msg.transaction_id == req.transaction_id && msg.is_binding_success() {
                return Ok(msg);
            }
        }
    }

    /// The reflexive address of this socket as seen by the server.
    /// XOR-MAPPED-ADDRESS wins; MAPPED-ADDRESS is the fallback.
    pub async fn external_addr(&self) -> Result<SocketAddr, StunError> {
        let msg = self.request().await?;
        msg.xor_mapped_address()
            .or_else(|| msg.mapped_address())
            .ok_or(StunError::NoAddress)
    }

    /// The server's alternate address (OTHER-ADDRESS, or the legacy
    /// CHANGED-ADDRESS), if it advertises one.
    pub async fn other_address(&self) -> Result<Option<SocketAddr>, StunError> {
        let msg = self.request().await?;
        Ok(msg.other_address().or_else(|| msg.changed_address()))
    }

    /// All distinct reflexive addresses discoverable from this server: the
    /// primary binding result plus, when the server advertises an alternate
    /// address, a second probe through it. A differing second result reveals
    /// a symmetric NAT; callers use only the first entry as the external
    /// address either way.
    pub async fn external_addrs(&self) -> Result<Vec<SocketAddr>, StunError> {
        let primary = self.external_addr().await?;
        let mut addrs = vec![primary];

        if let Ok(Some(other)) = self.other_address().await {
            let alt = StunClient {
                socket: Arc::clone(&self.socket),
                server: other,
            };
            if let Ok(addr) = alt.external_addr().await {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }

        Ok(addrs)
    }
}
