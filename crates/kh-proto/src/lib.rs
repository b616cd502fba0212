// kh-proto: Signaling and registry protocol types and serialization.
//
// All WebSocket frames use a top-level `kind` field for discriminated
// deserialization. Unary RPC bodies are plain JSON structs. The binary
// HostMessage payload and the address wire forms live in `wire`.

use serde::{Deserialize, Serialize};

pub mod wire;

pub use wire::{AddrWire, HostMessage, HostMessageKind, Ipv4AddrWire, Ipv6AddrWire, WireError};

// ---------------------------------------------------------------------------
// ICE credentials and candidates
// ---------------------------------------------------------------------------

/// The ufrag/pwd pair gating connectivity checks.
///
/// `need_creds` marks a request-for-response: the receiver should answer with
/// its own credentials (with `need_creds` cleared) exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
    #[serde(default)]
    pub need_creds: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

/// Transport family a candidate was gathered on. TCP variants are carried
/// for wire compatibility; gathering here is UDP-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpKind {
    Active,
    Passive,
    SimultaneousOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayProtocol {
    Udp,
    Tcp,
    Dtls,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedAddress {
    pub address: String,
    pub port: u16,
}

/// A connection endpoint advertised during negotiation.
///
/// Candidates are opaque to the broker and the registry; only sessions
/// construct and consume them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub foundation: String,
    pub component: u16,
    pub network: NetworkKind,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<RelatedAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_kind: Option<TcpKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_protocol: Option<RelayProtocol>,
}

// ---------------------------------------------------------------------------
// Broker envelope
// ---------------------------------------------------------------------------

/// The message fanned out to subscribers of a topic. At least one of `data`,
/// `credentials`, `candidate` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
}

impl Message {
    pub fn with_data(topic: impl Into<String>, data: Vec<u8>) -> Self {
        Message {
            topic: topic.into(),
            data,
            credentials: None,
            candidate: None,
        }
    }

    pub fn with_credentials(topic: impl Into<String>, credentials: Credentials) -> Self {
        Message {
            topic: topic.into(),
            data: Vec::new(),
            credentials: Some(credentials),
            candidate: None,
        }
    }

    pub fn with_candidate(topic: impl Into<String>, candidate: Candidate) -> Self {
        Message {
            topic: topic.into(),
            data: Vec::new(),
            credentials: None,
            candidate: Some(candidate),
        }
    }
}

// ---------------------------------------------------------------------------
// Unary RPC bodies: signaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub hostname: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub topic: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {}

// ---------------------------------------------------------------------------
// Unary RPC bodies: registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOnlineRequest {
    pub hostname: String,
    #[serde(default)]
    pub v4: Vec<Ipv4AddrWire>,
    #[serde(default)]
    pub v6: Vec<Ipv6AddrWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Ipv4AddrWire>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOnlineResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdateRequest {
    pub hostname: String,
    #[serde(default)]
    pub v4: Vec<Ipv4AddrWire>,
    #[serde(default)]
    pub v6: Vec<Ipv6AddrWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Ipv4AddrWire>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdateResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueryRequest {
    pub hostname: String,
}

/// A miss is a success with empty lists, never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueryResponse {
    #[serde(default)]
    pub v4: Vec<Ipv4AddrWire>,
    #[serde(default)]
    pub v6: Vec<Ipv6AddrWire>,
}

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// Frames on a subscribe socket. The client's first frame is `Subscribe`;
/// every subsequent frame is server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum SignalFrame {
    Subscribe(SubscribeRequest),
    Message(Message),
    Error(ErrorFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

pub mod error_codes {
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
}

// ---------------------------------------------------------------------------
// base64 transport for binary payloads inside JSON
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_data_round_trips_through_base64() {
        let msg = Message::with_data("h1", vec![0x00, 0x01, 0xfe, 0xff]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"data\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn empty_data_is_omitted_and_defaults_on_decode() {
        let msg = Message::with_credentials(
            "h1",
            Credentials {
                ufrag: "u".to_owned(),
                pwd: "p".to_owned(),
                need_creds: true,
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"data\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn signal_frames_tag_with_kind() {
        let frame = SignalFrame::Subscribe(SubscribeRequest {
            topic: "h2".to_owned(),
            hostname: "h1".to_owned(),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"subscribe\""));
        let back: SignalFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn candidate_kind_uses_kebab_case_on_the_wire() {
        let c = Candidate {
            kind: CandidateKind::ServerReflexive,
            foundation: "f1".to_owned(),
            component: 1,
            network: NetworkKind::Udp4,
            priority: 1_694_498_815,
            address: "9.9.9.9".to_owned(),
            port: 30000,
            related_address: Some(RelatedAddress {
                address: "10.0.0.1".to_owned(),
                port: 51820,
            }),
            tcp_kind: None,
            relay_protocol: None,
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"server-reflexive\""));
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
