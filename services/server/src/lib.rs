// server: Host registry with an embedded signaling broker.
// Exposes modules for integration testing.

pub mod config;
pub mod registry;
pub mod service;

pub use service::{registry_router, RegistryState};

use axum::Router;
use kh_broker::{signaling_router, Broker, SignalingState};
use std::sync::Arc;

/// The full router of the combined server: registry RPCs plus the broker's
/// signaling surface, sharing one fan-out engine.
pub fn build_router(broker: Arc<Broker>) -> (Router, RegistryState) {
    let state = RegistryState::new(Arc::clone(&broker));
    let router = registry_router(state.clone()).merge(signaling_router(SignalingState { broker }));
    (router, state)
}
