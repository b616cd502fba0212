//! Client reconciliation loop.
//!
//! Per tick (default 30 s): harvest local interface addresses, probe STUN
//! for the reflexive address, and push the combined lists to the registry.
//! Between ticks, subscription forwarders deliver peer notifications to the
//! loaded plugins and schedule hole-punch datagrams toward every address the
//! peer advertises. No failure inside a cycle aborts the loop; everything is
//! logged and retried on the next cycle.

use crate::plugin::Plugin;
use crate::registry::RegistryClient;
use crate::signal::SignalingClient;
use kh_ice::candidate::local_addresses;
use kh_ice::StunClient;
use kh_proto::{
    AddrWire, HostMessage, HostMessageKind, HostOnlineRequest, HostUpdateRequest, Ipv4AddrWire,
    Ipv6AddrWire,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK: Duration = Duration::from_secs(30);
/// STUN round-trip budget per server.
pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace before a punch datagram is sent, giving the peer's own punches
/// time to open its NAT.
pub const PUNCH_DELAY: Duration = Duration::from_secs(1);

const RESUBSCRIBE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("failed to bind punch socket: {0}")]
    Bind(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub hostname: String,
    pub endpoint_port: u16,
    pub stun_servers: Vec<String>,
    pub subscriptions: Vec<String>,
    pub tick: Duration,
    pub punch_delay: Duration,
}

/// The punch sockets share the advertised endpoint port, one per family.
/// The v6 bind can collide with the v4 wildcard on dual-stack hosts; losing
/// it only disables v6 punches.
struct PunchSockets {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl PunchSockets {
    async fn bind(port: u16) -> Result<Self, ReconcilerError> {
        let v4 = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(ReconcilerError::Bind)?;
        let v6 = match UdpSocket::bind(("::", port)).await {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                debug!(error = %e, "no v6 punch socket");
                None
            }
        };
        Ok(PunchSockets {
            v4: Some(Arc::new(v4)),
            v6,
        })
    }

    fn for_addr(&self, addr: SocketAddr) -> Option<Arc<UdpSocket>> {
        if addr.is_ipv4() {
            self.v4.clone()
        } else {
            self.v6.clone()
        }
    }
}

pub struct Reconciler {
    cfg: ReconcilerConfig,
    registry: Arc<RegistryClient>,
    /// Client against the broker the registry publishes into.
    notifications: Arc<SignalingClient>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Reconciler {
    pub fn new(
        cfg: ReconcilerConfig,
        registry: Arc<RegistryClient>,
        notifications: Arc<SignalingClient>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Self {
        Reconciler {
            cfg,
            registry,
            notifications,
            plugins,
        }
    }

    /// Drive the loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcilerError> {
        let sockets = Arc::new(PunchSockets::bind(self.cfg.endpoint_port).await?);

        let mut forwarders = Vec::new();
        for topic in &self.cfg.subscriptions {
            forwarders.push(tokio::spawn(subscription_loop(
                Arc::clone(&self.notifications),
                topic.clone(),
                self.plugins.clone(),
                Arc::clone(&sockets),
                self.cfg.punch_delay,
                shutdown.clone(),
            )));
        }

        // Announce presence once; the registry publishes online
        // notifications unconditionally.
        let (v4, v6, external) = self.collect_addrs().await;
        if let Err(e) = self
            .registry
            .host_online(&HostOnlineRequest {
                hostname: self.cfg.hostname.clone(),
                v4,
                v6,
                external,
            })
            .await
        {
            warn!(error = %e, "host online announcement failed");
        }

        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.send_update().await;
                }
            }
        }

        for f in forwarders {
            f.abort();
        }
        info!("reconciler stopped");
        Ok(())
    }

    /// One cycle: harvest, probe, fan out, report.
    async fn send_update(&self) {
        let (v4, v6, external) = self.collect_addrs().await;

        // Plugins see the same picture the registry is about to get.
        let mut local_view = HostMessage::new(
            HostMessageKind::HostUpdateNotification,
            self.cfg.hostname.clone(),
        );
        local_view.v4 = v4.clone();
        local_view.v6 = v6.clone();
        local_view.external = external;
        for plugin in &self.plugins {
            let plugin = Arc::clone(plugin);
            let msg = local_view.clone();
            tokio::spawn(async move {
                plugin.handle(&msg).await;
            });
        }

        let request = HostUpdateRequest {
            hostname: self.cfg.hostname.clone(),
            v4,
            v6,
            external,
        };
        debug!(
            hostname = %request.hostname,
            v4 = request.v4.len(),
            v6 = request.v6.len(),
            "sending host update"
        );
        if let Err(e) = self.registry.host_update(&request).await {
            warn!(error = %e, "host update failed, will retry next tick");
        }
    }

    /// Local interface addresses tagged with the endpoint port, plus the
    /// reflexive addresses from the first STUN server that answers.
    async fn collect_addrs(
        &self,
    ) -> (Vec<Ipv4AddrWire>, Vec<Ipv6AddrWire>, Option<Ipv4AddrWire>) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for ip in local_addresses() {
            match AddrWire::from_ip(ip, self.cfg.endpoint_port) {
                AddrWire::V4(a) => v4.push(a),
                AddrWire::V6(a) => v6.push(a),
            }
        }

        let mut external = None;
        for server in &self.cfg.stun_servers {
            match self.probe(server).await {
                Ok(addrs) => {
                    for addr in &addrs {
                        match AddrWire::from_socket_addr(*addr) {
                            AddrWire::V4(a) => v4.push(a),
                            AddrWire::V6(a) => v6.push(a),
                        }
                    }
                    // Only the first successful result feeds the external
                    // field, and only a v4 reflexive address is usable there.
                    external = addrs.first().and_then(|a| match AddrWire::from_socket_addr(*a) {
                        AddrWire::V4(w) => Some(w),
                        AddrWire::V6(_) => None,
                    });
                    break;
                }
                Err(e) => {
                    debug!(server = %server, error = %e, "STUN probe failed, trying next");
                }
            }
        }

        (dedup_wire(v4), dedup_wire(v6), external)
    }

    async fn probe(&self, server: &str) -> Result<Vec<SocketAddr>, kh_ice::StunError> {
        let client = StunClient::new(server).await?;
        tokio::time::timeout(STUN_TIMEOUT, client.external_addrs())
            .await
            .map_err(|_| kh_ice::StunError::Unresolvable(server.to_owned()))?
    }
}

fn dedup_wire<T: PartialEq + Copy>(list: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(list.len());
    for item in list {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Subscription forwarding
// ---------------------------------------------------------------------------

/// Keep one topic subscribed, dispatching every decodable notification,
/// reconnecting with exponential backoff when the stream drops.
async fn subscription_loop(
    signaling: Arc<SignalingClient>,
    topic: String,
    plugins: Vec<Arc<dyn Plugin>>,
    sockets: Arc<PunchSockets>,
    punch_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RESUBSCRIBE_BACKOFF_INITIAL;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match signaling.subscribe(&topic).await {
            Ok(mut stream) => {
                backoff = RESUBSCRIBE_BACKOFF_INITIAL;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        msg = stream.next_message() => {
                            match msg {
                                Some(m) => handle_notification(m.topic, m.data, &plugins, &sockets, punch_delay),
                                None => {
                                    warn!(topic = %topic, "notification stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "subscribe failed");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
    }
}

fn handle_notification(
    topic: String,
    data: Vec<u8>,
    plugins: &[Arc<dyn Plugin>],
    sockets: &Arc<PunchSockets>,
    punch_delay: Duration,
) {
    if data.is_empty() {
        // Session traffic (credentials, candidates) shares these topics.
        return;
    }
    let hm = match HostMessage::decode(&data) {
        Ok(hm) => hm,
        Err(e) => {
            warn!(topic = %topic, len = data.len(), error = %e, "undecodable host message");
            return;
        }
    };
    info!(hostname = %hm.hostname, kind = ?hm.kind, "host notification");

    for plugin in plugins {
        let plugin = Arc::clone(plugin);
        let msg = hm.clone();
        tokio::spawn(async move {
            plugin.handle(&msg).await;
        });
    }

    match hm.kind {
        HostMessageKind::HostOnlineNotification | HostMessageKind::HostPunchNotification => {
            schedule_punches(sockets, &hm, punch_delay);
        }
        _ => {}
    }
}

/// One delayed datagram per advertised address, fired from the endpoint
/// port so the peer's checks find an open mapping.
fn schedule_punches(sockets: &Arc<PunchSockets>, hm: &HostMessage, delay: Duration) {
    let payload = match HostMessage::new(HostMessageKind::None, "").encode() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to encode punch payload");
            return;
        }
    };

    let targets = hm
        .v4
        .iter()
        .map(Ipv4AddrWire::socket_addr)
        .chain(hm.v6.iter().map(Ipv6AddrWire::socket_addr));

    for addr in targets {
        let Some(socket) = sockets.for_addr(addr) else {
            continue;
        };
        let payload = payload.clone();
        let hostname = hm.hostname.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match socket.send_to(&payload, addr).await {
                Ok(_) => debug!(%addr, %hostname, "punching"),
                Err(e) => debug!(%addr, %hostname, error = %e, "punch send failed"),
            }
        });
    }
}
