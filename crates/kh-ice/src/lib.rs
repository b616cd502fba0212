// kh-ice: STUN binding client and a minimal ICE agent.
//
// Implements the cooperative subset of ICE this system needs: host and
// server-reflexive candidates over UDP, ufrag/pwd-gated binding checks, and
// dial/accept roles. Relay candidates and TCP transports exist only as wire
// vocabulary.

pub mod agent;
pub mod candidate;
pub mod stun;

pub use agent::{Agent, AgentConfig, AgentEvent, ConnectionState, IceConn, IceError};
pub use stun::{StunClient, StunError};
