//! Peer coordination core for NAT traversal.
//!
//! The workspace establishes direct peer-to-peer UDP connectivity between
//! hosts behind NATs: each client discovers its external presence through
//! STUN, advertises it through the registry server, learns peers' presence
//! from the signaling broker, and negotiates a usable endpoint pair with
//! credential-gated connectivity checks.
//!
//! This root crate only carries the cross-service integration suites under
//! `tests/integration/`; the functionality lives in the `kh-*` crates and
//! the `signal`, `server`, and `client` services.
