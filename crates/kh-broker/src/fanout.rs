//! Topic-scoped fan-out engine.
//!
//! Every subscriber owns a bounded channel (default capacity 10). A publish
//! delivers to each subscriber of the topic in turn, waiting at most the
//! publish timeout (default 100 ms) per subscriber. A subscriber that cannot
//! accept in time is skipped for that message but stays subscribed; a
//! subscriber whose channel is gone is evicted. Messages are never retried.
//!
//! Ordering: one publisher awaiting its publishes sees its messages arrive
//! at any given subscriber in send order. Nothing is promised across
//! publishers or across subscribers.

use kh_proto::Message;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 10;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// One subscriber's end of a topic.
///
/// Receiving `None` means the subscription ended: an explicit unsubscribe,
/// a replacement subscription under the same identity, or broker shutdown.
pub struct Subscription {
    pub topic: String,
    pub hostname: String,
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Non-blocking drain, used by tests.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// Process-local topic registry and dispatcher.
pub struct Broker {
    topics: Mutex<HashMap<String, HashMap<String, mpsc::Sender<Message>>>>,
    buffer: usize,
    publish_timeout: Duration,
}

impl Default for Broker {
    fn default() -> Self {
        Broker::new(DEFAULT_PUBLISH_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl Broker {
    pub fn new(publish_timeout: Duration, buffer: usize) -> Self {
        Broker {
            topics: Mutex::new(HashMap::new()),
            buffer,
            publish_timeout,
        }
    }

    /// Register `hostname` on `topic`. A second subscribe under the same
    /// identity replaces the first, ending its stream.
    pub fn subscribe(&self, topic: &str, hostname: &str) -> Result<Subscription, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidArgument("missing topic"));
        }
        if hostname.is_empty() {
            return Err(BrokerError::InvalidArgument("missing hostname"));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .insert(hostname.to_owned(), tx);
        debug!(topic, hostname, "subscribed");

        Ok(Subscription {
            topic: topic.to_owned(),
            hostname: hostname.to_owned(),
            receiver: rx,
        })
    }

    /// Evict `(topic, hostname)`. Returns whether a subscription existed.
    pub fn unsubscribe(&self, topic: &str, hostname: &str) -> Result<bool, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidArgument("missing topic"));
        }
        if hostname.is_empty() {
            return Err(BrokerError::InvalidArgument("missing hostname"));
        }

        let mut topics = self.topics.lock().unwrap();
        let Some(subscribers) = topics.get_mut(topic) else {
            warn!(topic, hostname, "unsubscribe for unknown topic");
            return Ok(false);
        };
        let existed = subscribers.remove(hostname).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        if existed {
            debug!(topic, hostname, "unsubscribed");
        } else {
            warn!(topic, hostname, "unsubscribe for unknown subscriber");
        }
        Ok(existed)
    }

    /// Deliver `message` to every current subscriber of its topic.
    ///
    /// Never fails because of subscriber behavior: slow subscribers are
    /// skipped for this message, dead ones are evicted.
    pub async fn publish(&self, message: Message) {
        let targets: Vec<(String, mpsc::Sender<Message>)> = {
            let topics = self.topics.lock().unwrap();
            match topics.get(&message.topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(name, tx)| (name.clone(), tx.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut dead = Vec::new();
        for (hostname, tx) in targets {
            match tokio::time::timeout(self.publish_timeout, tx.send(message.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Receiver side is gone.
                    dead.push((hostname, tx));
                }
                Err(_) => {
                    debug!(
                        topic = %message.topic,
                        subscriber = %hostname,
                        "subscriber too slow, skipping message"
                    );
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.topics.lock().unwrap();
            if let Some(subscribers) = topics.get_mut(&message.topic) {
                for (hostname, tx) in dead {
                    // Only evict if the registered channel is still the one
                    // that failed; the identity may have resubscribed.
                    if subscribers
                        .get(&hostname)
                        .is_some_and(|cur| cur.same_channel(&tx))
                    {
                        subscribers.remove(&hostname);
                        debug!(topic = %message.topic, subscriber = %hostname, "evicted dead subscriber");
                    }
                }
                if subscribers.is_empty() {
                    topics.remove(&message.topic);
                }
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, HashMap::len)
    }

    /// Drop every subscriber channel, ending all streams.
    pub fn close(&self) {
        self.topics.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, payload: &[u8]) -> Message {
        Message::with_data(topic, payload.to_vec())
    }

    #[tokio::test]
    async fn fanout_delivers_in_order_to_all_subscribers() {
        let broker = Broker::default();
        let mut a = broker.subscribe("t", "sub-a").unwrap();
        let mut b = broker.subscribe("t", "sub-b").unwrap();

        for i in 1..=3u8 {
            broker.publish(msg("t", &[i])).await;
        }

        for sub in [&mut a, &mut b] {
            for i in 1..=3u8 {
                assert_eq!(sub.recv().await.unwrap().data, vec![i]);
            }
        }
    }

    #[tokio::test]
    async fn publish_to_topic_without_subscribers_is_a_noop() {
        let broker = Broker::default();
        broker.publish(msg("empty", b"x")).await;
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_topic() {
        let broker = Broker::default();
        let mut a = broker.subscribe("t1", "sub").unwrap();
        broker.publish(msg("t2", b"other")).await;
        broker.publish(msg("t1", b"mine")).await;
        assert_eq!(a.recv().await.unwrap().data, b"mine".to_vec());
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_skipped_but_stays_subscribed() {
        let broker = Broker::new(Duration::from_millis(20), DEFAULT_SUBSCRIBER_BUFFER);
        let mut fast = broker.subscribe("t", "fast").unwrap();
        let mut slow = broker.subscribe("t", "slow").unwrap();

        // `fast` reads continuously; `slow` never reads.
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(m) = fast.recv().await {
                got.push(m.data[0]);
                if got.len() == 20 {
                    break;
                }
            }
            got
        });

        for i in 0..20u8 {
            broker.publish(msg("t", &[i])).await;
        }

        let fast_got = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("fast reader starved")
            .unwrap();
        assert_eq!(fast_got, (0..20u8).collect::<Vec<_>>());

        let mut slow_got = 0;
        while slow.try_recv().is_some() {
            slow_got += 1;
        }
        assert!(slow_got <= 10, "slow subscriber got {slow_got} > buffer");
        assert_eq!(broker.subscriber_count("t"), 2, "slow must stay subscribed");
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream_and_stops_delivery() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("t", "s1").unwrap();
        assert!(broker.unsubscribe("t", "s1").unwrap());
        broker.publish(msg("t", b"after")).await;
        assert!(sub.recv().await.is_none());
        assert_eq!(broker.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_evicted_on_next_publish() {
        let broker = Broker::default();
        let sub = broker.subscribe("t", "s1").unwrap();
        drop(sub);
        broker.publish(msg("t", b"x")).await;
        assert_eq!(broker.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_identity() {
        let broker = Broker::default();
        let mut first = broker.subscribe("t", "s1").unwrap();
        let mut second = broker.subscribe("t", "s1").unwrap();
        broker.publish(msg("t", b"x")).await;
        assert!(first.recv().await.is_none());
        assert_eq!(second.recv().await.unwrap().data, b"x".to_vec());
        assert_eq!(broker.subscriber_count("t"), 1);
    }

    #[test]
    fn empty_topic_or_hostname_is_invalid() {
        let broker = Broker::default();
        assert!(matches!(
            broker.subscribe("", "h"),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            broker.subscribe("t", ""),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            broker.unsubscribe("", "h"),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            broker.unsubscribe("t", ""),
            Err(BrokerError::InvalidArgument(_))
        ));
    }
}
