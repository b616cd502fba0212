// kh-broker: topic-scoped signaling broker.
//
// `fanout` is the process-local engine; `service` is its HTTP/WS surface.
// The registry server embeds both, the signal binary serves them standalone.

pub mod fanout;
pub mod service;

pub use fanout::{Broker, BrokerError, Subscription, DEFAULT_PUBLISH_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER};
pub use service::{signaling_router, SignalingState};
