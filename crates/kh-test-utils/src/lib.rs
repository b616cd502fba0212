// kh-test-utils: in-process service harnesses for the test suites.
//
// Spawns the signaling broker or the full registry server on an ephemeral
// loopback port and exposes the underlying broker so tests can subscribe
// and publish without going through the wire themselves.

use kh_broker::{signaling_router, Broker, SignalingState};
use server::RegistryState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SUBSCRIBER_WAIT: Duration = Duration::from_secs(5);

async fn serve(router: axum::Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind harness listener");
    let addr = listener.local_addr().expect("harness local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (addr, handle)
}

async fn wait_for_subscriber(broker: &Broker, topic: &str) {
    tokio::time::timeout(SUBSCRIBER_WAIT, async {
        while broker.subscriber_count(topic) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no subscriber appeared on topic {topic}"));
}

/// A standalone signaling broker on an ephemeral port.
pub struct SignalingHarness {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    handle: JoinHandle<()>,
}

impl SignalingHarness {
    pub async fn spawn() -> Self {
        let broker = Arc::new(Broker::default());
        let router = signaling_router(SignalingState {
            broker: Arc::clone(&broker),
        });
        let (addr, handle) = serve(router).await;
        SignalingHarness {
            addr,
            broker,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Block until some subscriber is registered on `topic`. Tests publish
    /// only after this, since the broker never buffers for absent
    /// subscribers.
    pub async fn wait_for_subscriber(&self, topic: &str) {
        wait_for_subscriber(&self.broker, topic).await;
    }
}

impl Drop for SignalingHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The combined registry server (registry RPCs + embedded broker) on an
/// ephemeral port.
pub struct RegistryHarness {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    pub state: RegistryState,
    handle: JoinHandle<()>,
}

impl RegistryHarness {
    pub async fn spawn() -> Self {
        let broker = Arc::new(Broker::default());
        let (router, state) = server::build_router(Arc::clone(&broker));
        let (addr, handle) = serve(router).await;
        RegistryHarness {
            addr,
            broker,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn wait_for_subscriber(&self, topic: &str) {
        wait_for_subscriber(&self.broker, topic).await;
    }
}

impl Drop for RegistryHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signaling_harness_serves_health() {
        let harness = SignalingHarness::spawn().await;
        let body = tokio::time::timeout(Duration::from_secs(5), async {
            // A plain TCP GET is enough to prove the listener is up.
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut stream = tokio::net::TcpStream::connect(harness.addr).await.unwrap();
            stream
                .write_all(b"GET /healthz HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut buf = String::new();
            stream.read_to_string(&mut buf).await.unwrap();
            buf
        })
        .await
        .unwrap();
        assert!(body.contains("200"), "unexpected response: {body}");
    }
}
