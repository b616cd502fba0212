//! Registry RPC surface and publication into the embedded broker.
//!
//! `host-online` always publishes; `host-update` publishes only when the
//! deduplicated address set actually changed, which keeps steady-state
//! reporters from generating a message storm while still propagating churn
//! on the next cycle.

use crate::registry::{has_address_changed, Cache, HostMap};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use kh_broker::Broker;
use kh_proto::{
    error_codes, ErrorFrame, HostMessage, HostMessageKind, HostOnlineRequest, HostOnlineResponse,
    HostQueryRequest, HostQueryResponse, HostUpdateRequest, HostUpdateResponse, Ipv4AddrWire,
    Ipv6AddrWire, Message,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct RegistryState {
    pub hosts: Arc<HostMap>,
    pub broker: Arc<Broker>,
}

impl RegistryState {
    pub fn new(broker: Arc<Broker>) -> Self {
        RegistryState {
            hosts: Arc::new(HostMap::default()),
            broker,
        }
    }
}

pub fn registry_router(state: RegistryState) -> Router {
    Router::new()
        .route("/api/v1/host-online", post(host_online))
        .route("/api/v1/host-update", post(host_update))
        .route("/api/v1/host-query", post(host_query))
        .with_state(state)
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

/// Split mapped-IPv6 entries out of the v6 list so every address has one
/// canonical wire form before it reaches the caches.
fn normalize_report(
    v4: Vec<Ipv4AddrWire>,
    v6: Vec<Ipv6AddrWire>,
) -> (Vec<Ipv4AddrWire>, Vec<Ipv6AddrWire>) {
    let mut out_v4 = v4;
    let mut out_v6 = Vec::with_capacity(v6.len());
    for a in v6 {
        match a.to_v4() {
            Some(mapped) => out_v4.push(mapped),
            None => out_v6.push(a),
        }
    }
    (out_v4, out_v6)
}

/// Apply one report and return the address snapshots around it.
fn apply_report(
    state: &RegistryState,
    hostname: &str,
    v4: Vec<Ipv4AddrWire>,
    v6: Vec<Ipv6AddrWire>,
    observed_from: SocketAddr,
) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let info = state.hosts.get_or_create(hostname);
    let old_addrs = info.remotes.copy_addrs();

    // Unconditional: movement then shows up in the new snapshot and the
    // change test decides publication.
    info.set_remote(observed_from);
    let (v4, v6) = normalize_report(v4, v6);
    info.remotes.set_reported(hostname, &v4, &v6);
    let new_addrs = info.remotes.copy_addrs();
    (old_addrs, new_addrs)
}

/// Compose the notification for `hostname` from its own cache entry:
/// learned first, then reported, per family.
fn coalesce_answer(kind: HostMessageKind, hostname: &str, cache: &Cache) -> HostMessage {
    let mut reply = HostMessage::new(kind, hostname);
    if let Some(v4) = &cache.v4 {
        reply.v4.extend(v4.learned.iter().copied());
        reply.v4.extend(v4.reported.iter().copied());
    }
    if let Some(v6) = &cache.v6 {
        reply.v6.extend(v6.learned.iter().copied());
        reply.v6.extend(v6.reported.iter().copied());
    }
    reply
}

/// Publish `reply` on the host's own topic. Encode failures are logged and
/// skipped; the next report will retry.
async fn publish_reply(state: &RegistryState, reply: HostMessage) {
    let topic = reply.hostname.clone();
    match reply.encode() {
        Ok(data) => {
            state
                .broker
                .publish(Message::with_data(topic, data))
                .await;
        }
        Err(e) => {
            error!(hostname = %topic, error = %e, "failed to encode host notification");
        }
    }
}

async fn host_online(
    State(state): State<RegistryState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<HostOnlineRequest>,
) -> Result<Json<HostOnlineResponse>, RpcError> {
    if req.hostname.is_empty() {
        return Err(invalid_argument("missing hostname"));
    }
    debug!(hostname = %req.hostname, %remote, "host online");

    apply_report(&state, &req.hostname, req.v4, req.v6, remote);

    let info = state.hosts.get_or_create(&req.hostname);
    let cache = info.remotes.cache_of(&req.hostname).unwrap_or_default();
    let mut reply = coalesce_answer(
        HostMessageKind::HostOnlineNotification,
        &req.hostname,
        &cache,
    );
    reply.external = req.external;

    // Online notifications publish unconditionally.
    publish_reply(&state, reply).await;

    Ok(Json(HostOnlineResponse {}))
}

async fn host_update(
    State(state): State<RegistryState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<HostUpdateRequest>,
) -> Result<Json<HostUpdateResponse>, RpcError> {
    if req.hostname.is_empty() {
        return Err(invalid_argument("missing hostname"));
    }

    let (old_addrs, new_addrs) = apply_report(&state, &req.hostname, req.v4, req.v6, remote);

    let info = state.hosts.get_or_create(&req.hostname);
    let cache = info.remotes.cache_of(&req.hostname).unwrap_or_default();
    let mut reply = coalesce_answer(
        HostMessageKind::HostPunchNotification,
        &req.hostname,
        &cache,
    );
    reply.external = req.external;

    debug!(
        hostname = %req.hostname,
        old = old_addrs.len(),
        new = new_addrs.len(),
        "host update"
    );

    if has_address_changed(&old_addrs, &new_addrs) {
        info!(hostname = %req.hostname, topic = %req.hostname, "address set changed, publishing");
        publish_reply(&state, reply).await;
    }

    Ok(Json(HostUpdateResponse {}))
}

async fn host_query(
    State(state): State<RegistryState>,
    Json(req): Json<HostQueryRequest>,
) -> Result<Json<HostQueryResponse>, RpcError> {
    if req.hostname.is_empty() {
        return Err(invalid_argument("missing hostname"));
    }

    // A miss is an empty result, not an error.
    let Some(info) = state.hosts.get(&req.hostname) else {
        return Ok(Json(HostQueryResponse::default()));
    };

    let mut resp = HostQueryResponse::default();
    for addr in info.remotes.copy_addrs() {
        match addr {
            SocketAddr::V4(a) => resp.v4.push(Ipv4AddrWire::new(*a.ip(), a.port())),
            SocketAddr::V6(a) => resp.v6.push(Ipv6AddrWire::new(*a.ip(), a.port())),
        }
    }
    Ok(Json(resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_v4(s: &str, port: u16) -> Ipv4AddrWire {
        Ipv4AddrWire::new(s.parse().unwrap(), port)
    }

    fn state_with_subscriber(topic: &str) -> (RegistryState, kh_broker::Subscription) {
        let broker = Arc::new(Broker::default());
        let sub = broker.subscribe(topic, "observer").unwrap();
        (RegistryState::new(broker), sub)
    }

    fn observed() -> SocketAddr {
        "192.0.2.1:40000".parse().unwrap()
    }

    async fn update(
        state: &RegistryState,
        hostname: &str,
        v4: Vec<Ipv4AddrWire>,
    ) -> Result<Json<HostUpdateResponse>, RpcError> {
        host_update(
            State(state.clone()),
            ConnectInfo(observed()),
            Json(HostUpdateRequest {
                hostname: hostname.to_owned(),
                v4,
                v6: vec![],
                external: None,
            }),
        )
        .await
    }

    #[tokio::test]
    async fn identical_updates_publish_once() {
        let (state, mut sub) = state_with_subscriber("h1");

        update(&state, "h1", vec![wire_v4("1.2.3.4", 5000)]).await.unwrap();
        update(&state, "h1", vec![wire_v4("1.2.3.4", 5000)]).await.unwrap();

        let first = sub.try_recv().expect("first update must publish");
        let decoded = HostMessage::decode(&first.data).unwrap();
        assert_eq!(decoded.kind, HostMessageKind::HostPunchNotification);
        assert!(decoded
            .v4
            .iter()
            .any(|a| a.socket_addr().to_string() == "1.2.3.4:5000"));

        assert!(sub.try_recv().is_none(), "identical update must be suppressed");
    }

    #[tokio::test]
    async fn changed_update_republishes() {
        let (state, mut sub) = state_with_subscriber("h1");

        update(&state, "h1", vec![wire_v4("1.2.3.4", 5000)]).await.unwrap();
        update(
            &state,
            "h1",
            vec![wire_v4("1.2.3.4", 5000), wire_v4("9.9.9.9", 5000)],
        )
        .await
        .unwrap();

        let _first = sub.try_recv().expect("first publish");
        let second = sub.try_recv().expect("changed set must republish");
        let decoded = HostMessage::decode(&second.data).unwrap();
        assert!(decoded
            .v4
            .iter()
            .any(|a| a.socket_addr().to_string() == "9.9.9.9:5000"));
    }

    #[tokio::test]
    async fn online_always_publishes() {
        let (state, mut sub) = state_with_subscriber("h1");

        for _ in 0..2 {
            host_online(
                State(state.clone()),
                ConnectInfo(observed()),
                Json(HostOnlineRequest {
                    hostname: "h1".to_owned(),
                    v4: vec![wire_v4("1.2.3.4", 5000)],
                    v6: vec![],
                    external: Some(wire_v4("203.0.113.5", 30000)),
                }),
            )
            .await
            .unwrap();
        }

        let first = sub.try_recv().expect("online publishes");
        let second = sub.try_recv().expect("online publishes unconditionally");
        for msg in [first, second] {
            let decoded = HostMessage::decode(&msg.data).unwrap();
            assert_eq!(decoded.kind, HostMessageKind::HostOnlineNotification);
            assert_eq!(
                decoded.external.unwrap().socket_addr().to_string(),
                "203.0.113.5:30000"
            );
        }
    }

    #[tokio::test]
    async fn query_miss_is_empty_success() {
        let broker = Arc::new(Broker::default());
        let state = RegistryState::new(broker);
        let Json(resp) = host_query(
            State(state),
            Json(HostQueryRequest {
                hostname: "nobody".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert!(resp.v4.is_empty());
        assert!(resp.v6.is_empty());
    }

    #[tokio::test]
    async fn query_returns_learned_and_reported() {
        let (state, _sub) = state_with_subscriber("h1");
        update(&state, "h1", vec![wire_v4("1.2.3.4", 5000)]).await.unwrap();

        let Json(resp) = host_query(
            State(state),
            Json(HostQueryRequest {
                hostname: "h1".to_owned(),
            }),
        )
        .await
        .unwrap();

        let strings: Vec<String> = resp.v4.iter().map(|a| a.socket_addr().to_string()).collect();
        assert!(strings.contains(&"1.2.3.4:5000".to_owned()), "reported present");
        assert!(
            strings.contains(&observed().to_string()),
            "learned address present: {strings:?}"
        );
    }

    #[tokio::test]
    async fn mapped_v6_report_is_normalized_to_v4() {
        let (state, _sub) = state_with_subscriber("h1");
        let mapped = Ipv6AddrWire::new("::ffff:1.2.3.4".parse().unwrap(), 5000);
        host_update(
            State(state.clone()),
            ConnectInfo(observed()),
            Json(HostUpdateRequest {
                hostname: "h1".to_owned(),
                v4: vec![],
                v6: vec![mapped],
                external: None,
            }),
        )
        .await
        .unwrap();

        let Json(resp) = host_query(
            State(state),
            Json(HostQueryRequest {
                hostname: "h1".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert!(resp.v6.is_empty());
        assert!(resp
            .v4
            .iter()
            .any(|a| a.socket_addr().to_string() == "1.2.3.4:5000"));
    }

    #[tokio::test]
    async fn empty_hostname_is_rejected() {
        let broker = Arc::new(Broker::default());
        let state = RegistryState::new(broker);
        let err = update(&state, "", vec![]).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1 .0.code, error_codes::INVALID_ARGUMENT);
    }
}
