//! HTTP/WS surface of the signaling broker.
//!
//! Unary operations are JSON POSTs; `Subscribe` is a WebSocket whose first
//! client frame is a `subscribe` request, after which the server pushes
//! `message` frames until the subscriber is evicted or the socket closes.

use crate::fanout::{Broker, BrokerError};
use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use kh_proto::{
    error_codes, ErrorFrame, Message, PublishRequest, PublishResponse, SignalFrame,
    SubscribeRequest, UnsubscribeRequest, UnsubscribeResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the server waits for the client's initial `subscribe` frame.
const SUBSCRIBE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct SignalingState {
    pub broker: Arc<Broker>,
}

pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/publish", post(publish))
        .route("/api/v1/unsubscribe", post(unsubscribe))
        .route("/ws/v1/subscribe", get(ws_subscribe))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

type RpcError = (StatusCode, Json<ErrorFrame>);

fn invalid_argument(message: &str) -> RpcError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorFrame {
            code: error_codes::INVALID_ARGUMENT.to_owned(),
            message: message.to_owned(),
        }),
    )
}

async fn publish(
    State(state): State<SignalingState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, RpcError> {
    if req.topic.is_empty() {
        return Err(invalid_argument("missing topic"));
    }
    if req.hostname.is_empty() {
        return Err(invalid_argument("missing hostname"));
    }
    if req.data.is_empty() && req.credentials.is_none() && req.candidate.is_none() {
        return Err(invalid_argument("publish carries no payload"));
    }

    debug!(topic = %req.topic, hostname = %req.hostname, "publish");
    state
        .broker
        .publish(Message {
            topic: req.topic,
            data: req.data,
            credentials: req.credentials,
            candidate: req.candidate,
        })
        .await;
    Ok(Json(PublishResponse {}))
}

async fn unsubscribe(
    State(state): State<SignalingState>,
    Json(req): Json<UnsubscribeRequest>,
) -> Result<Json<UnsubscribeResponse>, RpcError> {
    match state.broker.unsubscribe(&req.topic, &req.hostname) {
        Ok(_) => Ok(Json(UnsubscribeResponse {})),
        Err(BrokerError::InvalidArgument(what)) => Err(invalid_argument(what)),
    }
}

async fn ws_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscribe_socket(socket, state))
}

async fn send_error_frame(socket: &mut WebSocket, code: &str, message: &str) {
    let frame = SignalFrame::Error(ErrorFrame {
        code: code.to_owned(),
        message: message.to_owned(),
    });
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(WsFrame::Text(json.into())).await;
    }
}

async fn handle_subscribe_socket(mut socket: WebSocket, state: SignalingState) {
    let request = match read_subscribe_request(&mut socket).await {
        Ok(req) => req,
        Err(reason) => {
            send_error_frame(&mut socket, error_codes::PROTOCOL_ERROR, reason).await;
            return;
        }
    };

    let mut subscription = match state.broker.subscribe(&request.topic, &request.hostname) {
        Ok(sub) => sub,
        Err(BrokerError::InvalidArgument(what)) => {
            send_error_frame(&mut socket, error_codes::INVALID_ARGUMENT, what).await;
            return;
        }
    };
    info!(topic = %request.topic, hostname = %request.hostname, "subscriber connected");

    loop {
        tokio::select! {
            item = subscription.recv() => {
                match item {
                    Some(message) => {
                        let frame = SignalFrame::Message(message);
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to encode message frame");
                                continue;
                            }
                        };
                        if socket.send(WsFrame::Text(json.into())).await.is_err() {
                            // Send error closes the stream and evicts.
                            let _ = state.broker.unsubscribe(&request.topic, &request.hostname);
                            return;
                        }
                    }
                    None => {
                        // Evicted (explicit unsubscribe, replacement, or
                        // broker shutdown): close out the stream.
                        debug!(topic = %request.topic, hostname = %request.hostname, "subscription ended");
                        let _ = socket.send(WsFrame::Close(None)).await;
                        return;
                    }
                }
            }
            frame = socket.recv() => {
                match frame {
                    None | Some(Ok(WsFrame::Close(_))) | Some(Err(_)) => {
                        // Consumer is gone; evict its channel.
                        let _ = state.broker.unsubscribe(&request.topic, &request.hostname);
                        debug!(topic = %request.topic, hostname = %request.hostname, "subscriber disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn read_subscribe_request(socket: &mut WebSocket) -> Result<SubscribeRequest, &'static str> {
    let first = tokio::time::timeout(SUBSCRIBE_HANDSHAKE_TIMEOUT, socket.recv()).await;
    match first {
        Ok(Some(Ok(WsFrame::Text(text)))) => match serde_json::from_str::<SignalFrame>(&text) {
            Ok(SignalFrame::Subscribe(req)) => Ok(req),
            Ok(_) => Err("expected subscribe frame"),
            Err(_) => Err("invalid JSON in subscribe frame"),
        },
        Ok(_) => Err("expected text subscribe frame"),
        Err(_) => Err("timeout waiting for subscribe frame"),
    }
}
