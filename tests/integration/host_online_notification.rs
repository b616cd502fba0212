//! Online announcements propagate to subscribers unconditionally and the
//! query RPC reflects the accumulated address cache.

use client::registry::RegistryClient;
use client::signal::SignalingClient;
use kh_proto::{
    HostMessage, HostMessageKind, HostOnlineRequest, HostQueryRequest, Ipv4AddrWire,
};
use kh_test_utils::RegistryHarness;
use std::time::Duration;

#[tokio::test]
async fn online_notification_reaches_subscribers_with_external_addr() {
    let harness = RegistryHarness::spawn().await;
    let registry = RegistryClient::new(&harness.base_url());
    let observer = SignalingClient::new(&harness.base_url(), "observer");

    let mut stream = observer.subscribe("h2").await.unwrap();
    harness.wait_for_subscriber("h2").await;

    let request = HostOnlineRequest {
        hostname: "h2".to_owned(),
        v4: vec![Ipv4AddrWire::new("10.0.0.7".parse().unwrap(), 51820)],
        v6: vec![],
        external: Some(Ipv4AddrWire::new("203.0.113.9".parse().unwrap(), 30000)),
    };
    registry.host_online(&request).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), stream.next_message())
        .await
        .expect("no online notification")
        .unwrap();
    let decoded = HostMessage::decode(&msg.data).unwrap();
    assert_eq!(decoded.kind, HostMessageKind::HostOnlineNotification);
    assert_eq!(decoded.hostname, "h2");
    assert!(decoded
        .v4
        .iter()
        .any(|a| a.socket_addr().to_string() == "10.0.0.7:51820"));
    assert_eq!(
        decoded.external.unwrap().socket_addr().to_string(),
        "203.0.113.9:30000"
    );
}

#[tokio::test]
async fn query_reflects_accumulated_cache_and_misses_are_empty() {
    let harness = RegistryHarness::spawn().await;
    let registry = RegistryClient::new(&harness.base_url());

    // Miss first: success with empty lists.
    let miss = registry
        .host_query(&HostQueryRequest {
            hostname: "h2".to_owned(),
        })
        .await
        .unwrap();
    assert!(miss.v4.is_empty() && miss.v6.is_empty());

    registry
        .host_online(&HostOnlineRequest {
            hostname: "h2".to_owned(),
            v4: vec![Ipv4AddrWire::new("10.0.0.7".parse().unwrap(), 51820)],
            v6: vec![],
            external: None,
        })
        .await
        .unwrap();

    let hit = registry
        .host_query(&HostQueryRequest {
            hostname: "h2".to_owned(),
        })
        .await
        .unwrap();
    assert!(hit
        .v4
        .iter()
        .any(|a| a.socket_addr().to_string() == "10.0.0.7:51820"));
}
