//! Registry publication behavior over the wire: an update publishes on the
//! host's topic exactly when the deduplicated address set changes.

use client::registry::RegistryClient;
use client::signal::SignalingClient;
use kh_proto::{HostMessage, HostMessageKind, HostUpdateRequest, Ipv4AddrWire};
use kh_test_utils::RegistryHarness;
use std::time::Duration;

fn wire_v4(s: &str, port: u16) -> Ipv4AddrWire {
    Ipv4AddrWire::new(s.parse().unwrap(), port)
}

fn update_request(hostname: &str, v4: Vec<Ipv4AddrWire>) -> HostUpdateRequest {
    HostUpdateRequest {
        hostname: hostname.to_owned(),
        v4,
        v6: vec![],
        external: None,
    }
}

/// Identical consecutive updates produce exactly one broker message.
#[tokio::test]
async fn single_update_publishes_once() {
    let harness = RegistryHarness::spawn().await;
    let registry = RegistryClient::new(&harness.base_url());
    let observer = SignalingClient::new(&harness.base_url(), "observer");

    let mut stream = observer.subscribe("h1").await.unwrap();
    harness.wait_for_subscriber("h1").await;

    let req = update_request("h1", vec![wire_v4("1.2.3.4", 5000)]);
    registry.host_update(&req).await.unwrap();
    registry.host_update(&req).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), stream.next_message())
        .await
        .expect("first update must publish")
        .unwrap();
    let decoded = HostMessage::decode(&msg.data).unwrap();
    assert_eq!(decoded.kind, HostMessageKind::HostPunchNotification);
    assert_eq!(decoded.hostname, "h1");
    assert!(decoded
        .v4
        .iter()
        .any(|a| a.socket_addr().to_string() == "1.2.3.4:5000"));

    // The identical second update must be suppressed.
    let second = tokio::time::timeout(Duration::from_millis(500), stream.next_message()).await;
    assert!(second.is_err(), "second identical update must not publish");
}

/// A changed address set publishes again, and the new payload carries the
/// added address.
#[tokio::test]
async fn changed_update_republishes() {
    let harness = RegistryHarness::spawn().await;
    let registry = RegistryClient::new(&harness.base_url());
    let observer = SignalingClient::new(&harness.base_url(), "observer");

    let mut stream = observer.subscribe("h1").await.unwrap();
    harness.wait_for_subscriber("h1").await;

    registry
        .host_update(&update_request("h1", vec![wire_v4("1.2.3.4", 5000)]))
        .await
        .unwrap();
    registry
        .host_update(&update_request(
            "h1",
            vec![wire_v4("1.2.3.4", 5000), wire_v4("9.9.9.9", 5000)],
        ))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next_message())
        .await
        .expect("first publish missing")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next_message())
        .await
        .expect("changed set must republish")
        .unwrap();

    let _ = HostMessage::decode(&first.data).unwrap();
    let decoded = HostMessage::decode(&second.data).unwrap();
    assert!(decoded
        .v4
        .iter()
        .any(|a| a.socket_addr().to_string() == "9.9.9.9:5000"));
}
