//! Full negotiation between two sessions sharing one signaling broker:
//! credential exchange, candidate exchange, and connectivity checks over
//! loopback, with the byte-order rule deciding who dials.

use client::session::{is_controlling, Session, SessionConfig, SessionState};
use client::signal::SignalingClient;
use kh_ice::AgentConfig;
use kh_proto::NetworkKind;
use kh_test_utils::SignalingHarness;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn session_config(source: &str, target: &str) -> SessionConfig {
    let mut cfg = SessionConfig::new(source, target);
    cfg.agent = AgentConfig {
        network_types: vec![NetworkKind::Udp4],
        include_loopback: true,
        check_interval: Duration::from_millis(20),
        ..AgentConfig::default()
    };
    cfg.initial_backoff = Duration::from_millis(100);
    cfg.max_backoff = Duration::from_secs(2);
    cfg
}

#[tokio::test]
async fn peers_negotiate_and_connect_over_loopback() {
    let harness = SignalingHarness::spawn().await;

    let alpha_signaling = Arc::new(SignalingClient::new(&harness.base_url(), "alpha"));
    let beta_signaling = Arc::new(SignalingClient::new(&harness.base_url(), "beta"));

    let alpha = Session::new(session_config("alpha", "beta"), alpha_signaling);
    let beta = Session::new(session_config("beta", "alpha"), beta_signaling);

    // "alpha" is the smaller byte integer, so it dials.
    assert!(alpha.is_controlling());
    assert!(!beta.is_controlling());
    assert!(is_controlling("aaaa", "bbbb"));
    assert!(!is_controlling("bbbb", "aaaa"));

    let mut alpha_monitor = alpha.monitor();
    let mut beta_monitor = beta.monitor();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let alpha_task = tokio::spawn(alpha.run(shutdown_rx.clone()));
    let beta_task = tokio::spawn(beta.run(shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(20),
        alpha_monitor.wait_for(SessionState::Connected),
    )
    .await
    .expect("alpha never connected");
    tokio::time::timeout(
        Duration::from_secs(20),
        beta_monitor.wait_for(SessionState::Connected),
    )
    .await
    .expect("beta never connected");

    assert_eq!(alpha_monitor.restarts(), 0);
    assert_eq!(beta_monitor.restarts(), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), alpha_task)
        .await
        .expect("alpha did not stop")
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), beta_task)
        .await
        .expect("beta did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(alpha_monitor.state(), SessionState::Closed);
    assert_eq!(beta_monitor.state(), SessionState::Closed);
}
