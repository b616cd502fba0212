//! Candidate construction helpers.
//!
//! Priorities follow the RFC 8445 recommended formula; foundations group
//! candidates that share a type, base address, and transport, which is all
//! the pairing logic here relies on.

use kh_proto::{Candidate, CandidateKind, NetworkKind, RelatedAddress};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

pub const COMPONENT_DEFAULT: u16 = 1;

const TYPE_PREFERENCE_HOST: u32 = 126;
const TYPE_PREFERENCE_PEER_REFLEXIVE: u32 = 110;
const TYPE_PREFERENCE_SERVER_REFLEXIVE: u32 = 100;
const TYPE_PREFERENCE_RELAY: u32 = 0;

const LOCAL_PREFERENCE_DEFAULT: u32 = 65535;

/// `(2^24) * type-pref + (2^8) * local-pref + (256 - component)`.
pub fn priority(kind: CandidateKind, local_preference: u32, component: u16) -> u32 {
    let type_preference = match kind {
        CandidateKind::Host => TYPE_PREFERENCE_HOST,
        CandidateKind::PeerReflexive => TYPE_PREFERENCE_PEER_REFLEXIVE,
        CandidateKind::ServerReflexive => TYPE_PREFERENCE_SERVER_REFLEXIVE,
        CandidateKind::Relay => TYPE_PREFERENCE_RELAY,
    };
    (type_preference << 24) + (local_preference << 8) + (256 - u32::from(component))
}

/// Foundation string shared by candidates of the same kind, base address,
/// and network.
fn foundation(kind: CandidateKind, base: IpAddr, network: NetworkKind) -> String {
    let mut hasher = DefaultHasher::new();
    (kind_tag(kind), base, network_tag(network)).hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

fn kind_tag(kind: CandidateKind) -> u8 {
    match kind {
        CandidateKind::Host => 0,
        CandidateKind::ServerReflexive => 1,
        CandidateKind::PeerReflexive => 2,
        CandidateKind::Relay => 3,
    }
}

fn network_tag(network: NetworkKind) -> u8 {
    match network {
        NetworkKind::Udp4 => 0,
        NetworkKind::Udp6 => 1,
        NetworkKind::Tcp4 => 2,
        NetworkKind::Tcp6 => 3,
    }
}

pub fn network_kind_of(ip: IpAddr) -> NetworkKind {
    if ip.is_ipv4() {
        NetworkKind::Udp4
    } else {
        NetworkKind::Udp6
    }
}

/// A host candidate for a local interface address.
pub fn host_candidate(addr: SocketAddr) -> Candidate {
    let network = network_kind_of(addr.ip());
    Candidate {
        kind: CandidateKind::Host,
        foundation: foundation(CandidateKind::Host, addr.ip(), network),
        component: COMPONENT_DEFAULT,
        network,
        priority: priority(CandidateKind::Host, LOCAL_PREFERENCE_DEFAULT, COMPONENT_DEFAULT),
        address: addr.ip().to_string(),
        port: addr.port(),
        related_address: None,
        tcp_kind: None,
        relay_protocol: None,
    }
}

/// A server-reflexive candidate discovered via STUN, related to the local
/// base socket it was observed from.
pub fn server_reflexive_candidate(external: SocketAddr, base: SocketAddr) -> Candidate {
    let network = network_kind_of(external.ip());
    Candidate {
        kind: CandidateKind::ServerReflexive,
        foundation: foundation(CandidateKind::ServerReflexive, base.ip(), network),
        component: COMPONENT_DEFAULT,
        network,
        priority: priority(
            CandidateKind::ServerReflexive,
            LOCAL_PREFERENCE_DEFAULT,
            COMPONENT_DEFAULT,
        ),
        address: external.ip().to_string(),
        port: external.port(),
        related_address: Some(RelatedAddress {
            address: base.ip().to_string(),
            port: base.port(),
        }),
        tcp_kind: None,
        relay_protocol: None,
    }
}

/// Parse the endpoint a remote candidate points at.
pub fn candidate_addr(candidate: &Candidate) -> Option<SocketAddr> {
    let ip: IpAddr = candidate.address.parse().ok()?;
    Some(SocketAddr::from((ip, candidate.port)))
}

/// Every usable local interface address: loopback and link-local addresses
/// are excluded, as are SLAAC-style temporary scopes implied by link-local.
pub fn local_addresses() -> Vec<IpAddr> {
    let Ok(ifaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    ifaces
        .into_iter()
        .map(|iface| iface.addr.ip())
        .filter(|ip| !ip.is_loopback() && !is_link_local(*ip))
        .collect()
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_priority_exceeds_server_reflexive_priority() {
        let host = host_candidate("10.0.0.1:5000".parse().unwrap());
        let srflx = server_reflexive_candidate(
            "203.0.113.9:30000".parse().unwrap(),
            "10.0.0.1:5000".parse().unwrap(),
        );
        assert!(host.priority > srflx.priority);
    }

    #[test]
    fn foundation_is_stable_per_base_and_kind() {
        let a = host_candidate("10.0.0.1:5000".parse().unwrap());
        let b = host_candidate("10.0.0.1:6000".parse().unwrap());
        let c = host_candidate("10.0.0.2:5000".parse().unwrap());
        assert_eq!(a.foundation, b.foundation);
        assert_ne!(a.foundation, c.foundation);
    }

    #[test]
    fn candidate_addr_parses_v4_and_v6() {
        let v4 = host_candidate("10.0.0.1:5000".parse().unwrap());
        assert_eq!(candidate_addr(&v4), Some("10.0.0.1:5000".parse().unwrap()));

        let v6 = host_candidate("[2001:db8::1]:443".parse().unwrap());
        assert_eq!(candidate_addr(&v6), Some("[2001:db8::1]:443".parse().unwrap()));
    }

    #[test]
    fn link_local_is_filtered() {
        assert!(is_link_local("169.254.1.1".parse().unwrap()));
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(!is_link_local("10.0.0.1".parse().unwrap()));
        assert!(!is_link_local("2001:db8::1".parse().unwrap()));
    }
}
