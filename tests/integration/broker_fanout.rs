//! Broker fan-out over the wire: every subscriber of a topic receives every
//! message in publish order, and a cancelled subscriber stops receiving.

use client::signal::SignalingClient;
use kh_test_utils::SignalingHarness;
use std::time::Duration;

async fn wait_for_subscribers(harness: &SignalingHarness, topic: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.subscriber_count(topic) < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {count} subscribers on {topic}"));
}

#[tokio::test]
async fn both_subscribers_receive_messages_in_order() {
    let harness = SignalingHarness::spawn().await;
    let publisher = SignalingClient::new(&harness.base_url(), "pub");
    let obs_a = SignalingClient::new(&harness.base_url(), "obs-a");
    let obs_b = SignalingClient::new(&harness.base_url(), "obs-b");

    let mut sub_a = obs_a.subscribe_as("t", "obs-a").await.unwrap();
    let mut sub_b = obs_b.subscribe_as("t", "obs-b").await.unwrap();
    wait_for_subscribers(&harness, "t", 2).await;

    for i in 1..=3u8 {
        publisher.publish_data("t", vec![i]).await.unwrap();
    }

    for sub in [&mut sub_a, &mut sub_b] {
        for i in 1..=3u8 {
            let msg = tokio::time::timeout(Duration::from_secs(5), sub.next_message())
                .await
                .expect("message missing")
                .unwrap();
            assert_eq!(msg.topic, "t");
            assert_eq!(msg.data, vec![i]);
        }
    }
}

#[tokio::test]
async fn cancelled_subscriber_receives_nothing_further() {
    let harness = SignalingHarness::spawn().await;
    let publisher = SignalingClient::new(&harness.base_url(), "pub");
    let obs_a = SignalingClient::new(&harness.base_url(), "obs-a");
    let obs_b = SignalingClient::new(&harness.base_url(), "obs-b");

    let mut sub_a = obs_a.subscribe_as("t", "obs-a").await.unwrap();
    let sub_b = obs_b.subscribe_as("t", "obs-b").await.unwrap();
    wait_for_subscribers(&harness, "t", 2).await;

    publisher.publish_data("t", vec![1]).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), sub_a.next_message())
        .await
        .expect("first message missing")
        .unwrap();
    assert_eq!(first.data, vec![1]);

    // Closing the socket cancels the subscription; the broker eventually
    // evicts the channel.
    drop(sub_b);
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.subscriber_count("t") > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cancelled subscriber never evicted");

    // Remaining subscriber still receives.
    publisher.publish_data("t", vec![2]).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), sub_a.next_message())
        .await
        .expect("second message missing")
        .unwrap();
    assert_eq!(second.data, vec![2]);
}

#[tokio::test]
async fn explicit_unsubscribe_ends_the_stream() {
    let harness = SignalingHarness::spawn().await;
    let observer = SignalingClient::new(&harness.base_url(), "obs");

    let mut sub = observer.subscribe_as("t", "obs").await.unwrap();
    wait_for_subscribers(&harness, "t", 1).await;

    observer.unsubscribe_as("t", "obs").await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), sub.next_message())
        .await
        .expect("stream should end after unsubscribe");
    assert!(ended.is_none());
    assert_eq!(harness.broker.subscriber_count("t"), 0);
}
