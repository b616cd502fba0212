//! Signaling client: unary publish/unsubscribe over HTTP, subscribe over a
//! WebSocket stream.
//!
//! # Protocol
//! 1. `POST {base}/api/v1/publish` with a JSON `PublishRequest`
//! 2. `GET ws://{base}/ws/v1/subscribe`, first frame `subscribe`, then read
//!    `message` frames until the socket closes or the broker evicts us

use futures_util::{SinkExt, StreamExt};
use kh_proto::{
    Candidate, Credentials, ErrorFrame, Message, PublishRequest, SignalFrame, SubscribeRequest,
    UnsubscribeRequest,
};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Unary deadline for credential publishes.
pub const CREDENTIALS_RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Unary deadline for candidate publishes.
pub const CANDIDATE_RPC_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("RPC timed out")]
    Timeout,
    #[error("broker rejected request: {0} ({1})")]
    Rejected(String, String),
}

/// Client half of the signaling protocol, shared by the reconciler and all
/// sessions of one process.
pub struct SignalingClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    hostname: String,
}

/// Turn `http(s)://host:port` (or bare `host:port`) into normalized HTTP and
/// WS base URLs.
fn normalize_base(url: &str) -> (String, String) {
    let trimmed = url.trim_end_matches('/');
    let http = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };
    let ws = if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        unreachable!("normalized above")
    };
    (http, ws)
}

impl SignalingClient {
    pub fn new(base_url: &str, hostname: &str) -> Self {
        let (http_url, ws_url) = normalize_base(base_url);
        SignalingClient {
            http: reqwest::Client::new(),
            base_url: http_url,
            ws_url,
            hostname: hostname.to_owned(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn publish(&self, req: PublishRequest, deadline: Duration) -> Result<(), SignalError> {
        let url = format!("{}/api/v1/publish", self.base_url);
        let response = tokio::time::timeout(deadline, self.http.post(&url).json(&req).send())
            .await
            .map_err(|_| SignalError::Timeout)??;
        if !response.status().is_success() {
            let status = response.status().to_string();
            let body: ErrorFrame = response.json().await.unwrap_or(ErrorFrame {
                code: status.clone(),
                message: String::new(),
            });
            return Err(SignalError::Rejected(body.code, body.message));
        }
        Ok(())
    }

    pub async fn publish_credentials(
        &self,
        topic: &str,
        credentials: Credentials,
    ) -> Result<(), SignalError> {
        self.publish(
            PublishRequest {
                topic: topic.to_owned(),
                hostname: self.hostname.clone(),
                data: Vec::new(),
                credentials: Some(credentials),
                candidate: None,
            },
            CREDENTIALS_RPC_TIMEOUT,
        )
        .await
    }

    pub async fn publish_candidate(
        &self,
        topic: &str,
        candidate: Candidate,
    ) -> Result<(), SignalError> {
        self.publish(
            PublishRequest {
                topic: topic.to_owned(),
                hostname: self.hostname.clone(),
                data: Vec::new(),
                credentials: None,
                candidate: Some(candidate),
            },
            CANDIDATE_RPC_TIMEOUT,
        )
        .await
    }

    pub async fn publish_data(&self, topic: &str, data: Vec<u8>) -> Result<(), SignalError> {
        self.publish(
            PublishRequest {
                topic: topic.to_owned(),
                hostname: self.hostname.clone(),
                data,
                credentials: None,
                candidate: None,
            },
            CREDENTIALS_RPC_TIMEOUT,
        )
        .await
    }

    /// Open a subscription for `topic` under the given subscriber identity.
    pub async fn subscribe_as(
        &self,
        topic: &str,
        subscriber: &str,
    ) -> Result<SubscribeStream, SignalError> {
        let url = format!("{}/ws/v1/subscribe", self.ws_url);
        let (mut ws, _resp) = connect_async(url.as_str()).await?;
        let frame = SignalFrame::Subscribe(SubscribeRequest {
            topic: topic.to_owned(),
            hostname: subscriber.to_owned(),
        });
        let json = serde_json::to_string(&frame).expect("subscribe frame serializes");
        ws.send(WsFrame::Text(json.into())).await?;
        debug!(topic, subscriber, "subscribed");
        Ok(SubscribeStream { ws })
    }

    /// Subscribe under this client's own hostname.
    pub async fn subscribe(&self, topic: &str) -> Result<SubscribeStream, SignalError> {
        self.subscribe_as(topic, &self.hostname).await
    }

    pub async fn unsubscribe_as(&self, topic: &str, subscriber: &str) -> Result<(), SignalError> {
        let url = format!("{}/api/v1/unsubscribe", self.base_url);
        let req = UnsubscribeRequest {
            topic: topic.to_owned(),
            hostname: subscriber.to_owned(),
        };
        let response = tokio::time::timeout(
            CREDENTIALS_RPC_TIMEOUT,
            self.http.post(&url).json(&req).send(),
        )
        .await
        .map_err(|_| SignalError::Timeout)??;
        if !response.status().is_success() {
            let status = response.status().to_string();
            return Err(SignalError::Rejected(status, String::new()));
        }
        Ok(())
    }
}

/// Server-push side of one subscription.
pub struct SubscribeStream {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl SubscribeStream {
    /// The next broker message, or `None` once the stream is over (socket
    /// closed, broker eviction, or an error frame).
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.ws.next().await? {
                Ok(WsFrame::Text(text)) => match serde_json::from_str::<SignalFrame>(&text) {
                    Ok(SignalFrame::Message(msg)) => return Some(msg),
                    Ok(SignalFrame::Error(err)) => {
                        warn!(code = %err.code, message = %err.message, "broker error frame");
                        return None;
                    }
                    Ok(SignalFrame::Subscribe(_)) => {
                        debug!("ignoring unexpected subscribe frame from server");
                    }
                    Err(e) => {
                        warn!(error = %e, len = text.len(), "undecodable frame, dropping");
                    }
                },
                Ok(WsFrame::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "subscribe stream error");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization_covers_schemes() {
        assert_eq!(
            normalize_base("http://a:1/"),
            ("http://a:1".to_owned(), "ws://a:1".to_owned())
        );
        assert_eq!(
            normalize_base("https://a:1"),
            ("https://a:1".to_owned(), "wss://a:1".to_owned())
        );
        assert_eq!(
            normalize_base("a:1"),
            ("http://a:1".to_owned(), "ws://a:1".to_owned())
        );
    }
}
