//! A minimal ICE agent for cooperating peers.
//!
//! The agent owns one UDP socket per address family, gathers host and
//! server-reflexive candidates from them, and runs credential-gated STUN
//! binding checks against the remote candidates it is fed. The controlling
//! side (`dial`) concludes on the first authenticated response; the
//! controlled side (`accept`) concludes on the first authenticated request.
//! Both sides keep sending checks until then, which is what actually opens
//! the NAT mappings in each direction.
//!
//! Candidates and state transitions are reported on an event channel; the
//! session layer owns the policy of what to do with them.

use crate::candidate::{
    candidate_addr, host_candidate, local_addresses, server_reflexive_candidate,
};
use crate::stun::{is_stun, parse_stun_uri, StunClient, StunError, StunMessage};
use kh_proto::{Candidate, Credentials, NetworkKind};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;

/// STUN probe budget during gathering, per server.
const GATHER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("STUN: {0}")]
    Stun(#[from] StunError),
    #[error("candidate has an unusable address: {0}")]
    BadCandidate(String),
    #[error("no local candidates gathered yet")]
    NotGathered,
    #[error("agent is closed")]
    Closed,
}

/// Connectivity as observed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What the agent reports to its owner.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A locally gathered candidate, ready to be advertised to the peer.
    Candidate(Candidate),
    StateChange(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub network_types: Vec<NetworkKind>,
    pub stun_servers: Vec<String>,
    /// Gather loopback host candidates too. Off in production; lets peers
    /// on one machine (and tests) negotiate without real interfaces.
    pub include_loopback: bool,
    pub check_interval: Duration,
    pub keepalive_interval: Duration,
    pub disconnected_timeout: Duration,
    pub failed_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            network_types: vec![NetworkKind::Udp4, NetworkKind::Udp6],
            stun_servers: Vec::new(),
            include_loopback: false,
            check_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(2),
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(15),
        }
    }
}

/// The endpoint pair a successful negotiation produced.
///
/// The core hands out endpoint information; it does not carry payload.
#[derive(Debug, Clone)]
pub struct IceConn {
    local: SocketAddr,
    peer: SocketAddr,
}

impl IceConn {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

struct Shared {
    local_ufrag: String,
    local_pwd: String,
    config: AgentConfig,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    remote_candidates: Mutex<Vec<(SocketAddr, u32)>>,
    remote_added: Notify,
    /// Transaction IDs of checks in flight, so responses can be attributed.
    pending_checks: Mutex<HashSet<[u8; 12]>>,
    selected: Mutex<Option<(Arc<UdpSocket>, SocketAddr)>>,
    last_seen: Mutex<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let _ = self.event_tx.send(AgentEvent::StateChange(next));
        }
    }

    fn select_pair(&self, socket: &Arc<UdpSocket>, peer: SocketAddr) {
        let mut selected = self.selected.lock().unwrap();
        if selected.is_none() {
            *selected = Some((Arc::clone(socket), peer));
        }
        drop(selected);
        *self.last_seen.lock().unwrap() = Instant::now();
        self.set_state(ConnectionState::Connected);
    }
}

pub struct Agent {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let (event_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            local_ufrag: random_token(UFRAG_LEN),
            local_pwd: random_token(PWD_LEN),
            config,
            event_tx,
            sockets: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            remote_added: Notify::new(),
            pending_checks: Mutex::new(HashSet::new()),
            selected: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            state_tx,
            shutdown_tx,
        });
        Agent {
            shared,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// The locally generated ufrag/pwd pair.
    pub fn local_credentials(&self) -> Credentials {
        Credentials {
            ufrag: self.shared.local_ufrag.clone(),
            pwd: self.shared.local_pwd.clone(),
            need_creds: false,
        }
    }

    /// The event stream. Yields `None` on the second call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AgentEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Addresses of the gathering sockets. Empty before `gather`.
    pub fn local_socket_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .sockets
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Bind the per-family sockets and emit host plus server-reflexive
    /// candidates. STUN servers are probed in order; the first one to answer
    /// per family wins.
    pub async fn gather(&self) -> Result<(), IceError> {
        let mut sockets = Vec::new();
        for network in &self.shared.config.network_types {
            let bind: SocketAddr = match network {
                NetworkKind::Udp4 => "0.0.0.0:0".parse().unwrap(),
                NetworkKind::Udp6 => "[::]:0".parse().unwrap(),
                NetworkKind::Tcp4 | NetworkKind::Tcp6 => continue,
            };
            match UdpSocket::bind(bind).await {
                Ok(socket) => sockets.push(Arc::new(socket)),
                Err(e) => warn!(family = ?network, error = %e, "failed to bind gathering socket"),
            }
        }
        if sockets.is_empty() {
            return Err(IceError::NotGathered);
        }
        *self.shared.sockets.lock().unwrap() = sockets.clone();

        for socket in &sockets {
            let base = socket.local_addr()?;
            let mut ips = local_addresses();
            if self.shared.config.include_loopback {
                ips.push(if base.is_ipv4() {
                    "127.0.0.1".parse().unwrap()
                } else {
                    "::1".parse().unwrap()
                });
            }
            let mut seen = HashSet::new();
            for ip in ips {
                if ip.is_ipv4() != base.is_ipv4() || !seen.insert(ip) {
                    continue;
                }
                let candidate = host_candidate(SocketAddr::from((ip, base.port())));
                let _ = self
                    .shared
                    .event_tx
                    .send(AgentEvent::Candidate(candidate));
            }

            for server in &self.shared.config.stun_servers {
                match self.probe_stun(socket, server).await {
                    Ok(external) => {
                        let candidate = server_reflexive_candidate(external, base);
                        let _ = self
                            .shared
                            .event_tx
                            .send(AgentEvent::Candidate(candidate));
                        break;
                    }
                    Err(e) => {
                        debug!(server = %server, error = %e, "STUN probe failed, trying next");
                    }
                }
            }
        }

        Ok(())
    }

    async fn probe_stun(
        &self,
        socket: &Arc<UdpSocket>,
        server: &str,
    ) -> Result<SocketAddr, IceError> {
        let hostport = parse_stun_uri(server)?;
        let base = socket.local_addr()?;
        let resolved = tokio::net::lookup_host(&hostport)
            .await?
            .find(|a| a.is_ipv4() == base.is_ipv4())
            .ok_or_else(|| StunError::Unresolvable(hostport.clone()))?;
        let client = StunClient::with_socket(Arc::clone(socket), resolved);
        let external = tokio::time::timeout(GATHER_PROBE_TIMEOUT, client.external_addr())
            .await
            .map_err(|_| StunError::Unresolvable(hostport))??;
        Ok(external)
    }

    /// Feed a remote candidate into the check list. Unusable candidates are
    /// an error for the caller to log; they never tear the agent down.
    pub fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), IceError> {
        let addr = candidate_addr(candidate)
            .ok_or_else(|| IceError::BadCandidate(candidate.address.clone()))?;
        let mut remotes = self.shared.remote_candidates.lock().unwrap();
        if !remotes.iter().any(|(a, _)| *a == addr) {
            remotes.push((addr, candidate.priority));
            remotes.sort_by(|a, b| b.1.cmp(&a.1));
        }
        drop(remotes);
        self.shared.remote_added.notify_waiters();
        Ok(())
    }

    /// Run checks as the controlling side and wait for connectivity.
    pub async fn dial(
        &self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<IceConn, IceError> {
        self.connect(true, remote_ufrag, remote_pwd).await
    }

    /// Run checks as the controlled side and wait for connectivity.
    pub async fn accept(
        &self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<IceConn, IceError> {
        self.connect(false, remote_ufrag, remote_pwd).await
    }

    async fn connect(
        &self,
        controlling: bool,
        remote_ufrag: String,
        _remote_pwd: String,
    ) -> Result<IceConn, IceError> {
        let sockets = self.shared.sockets.lock().unwrap().clone();
        if sockets.is_empty() {
            return Err(IceError::NotGathered);
        }
        if *self.shared.shutdown_tx.borrow() {
            return Err(IceError::Closed);
        }

        self.shared.set_state(ConnectionState::Checking);

        for socket in &sockets {
            tokio::spawn(receive_loop(
                Arc::clone(&self.shared),
                Arc::clone(socket),
                controlling,
                remote_ufrag.clone(),
            ));
        }
        tokio::spawn(check_loop(
            Arc::clone(&self.shared),
            sockets,
            remote_ufrag.clone(),
        ));
        tokio::spawn(liveness_loop(Arc::clone(&self.shared)));

        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            {
                let state = *state_rx.borrow();
                match state {
                    ConnectionState::Connected => break,
                    ConnectionState::Closed => return Err(IceError::Closed),
                    _ => {}
                }
            }
            if state_rx.changed().await.is_err() {
                return Err(IceError::Closed);
            }
        }

        let selected = self.shared.selected.lock().unwrap();
        let (socket, peer) = selected.as_ref().ok_or(IceError::Closed)?;
        Ok(IceConn {
            local: socket.local_addr()?,
            peer: *peer,
        })
    }

    /// Tear the agent down: background tasks unwind, the state becomes
    /// `Closed`, and the sockets are dropped.
    pub fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let changed = self.shared.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                false
            } else {
                *current = ConnectionState::Closed;
                true
            }
        });
        if changed {
            let _ = self
                .shared
                .event_tx
                .send(AgentEvent::StateChange(ConnectionState::Closed));
        }
        self.shared.sockets.lock().unwrap().clear();
        self.shared.remote_added.notify_waiters();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Handle inbound STUN on one socket: answer authenticated requests, accept
/// authenticated responses, and keep the liveness clock fresh.
async fn receive_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    controlling: bool,
    remote_ufrag: String,
) {
    let expected_request_username = format!("{}:{}", shared.local_ufrag, remote_ufrag);
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut buf = [0u8; 1500];

    loop {
        let (n, from) = tokio::select! {
            _ = shutdown_rx.changed() => return,
            recv = socket.recv_from(&mut buf) => match recv {
                Ok(v) => v,
                Err(_) => return,
            },
        };
        if !is_stun(&buf[..n]) {
            continue;
        }
        let Ok(msg) = StunMessage::decode(&buf[..n]) else {
            continue;
        };

        if msg.is_binding_request() {
            if msg.username() != Some(expected_request_username.as_str()) {
                debug!(%from, "dropping binding request with wrong username");
                continue;
            }
            let mut resp = StunMessage::binding_success(msg.transaction_id);
            resp.add_xor_mapped_address(from);
            let _ = socket.send_to(&resp.encode(), from).await;
            *shared.last_seen.lock().unwrap() = Instant::now();
            // An authenticated request proves the peer can reach us; the
            // controlled side selects on it.
            if !controlling {
                shared.select_pair(&socket, from);
            }
        } else if msg.is_binding_success() {
            let known = shared
                .pending_checks
                .lock()
                .unwrap()
                .remove(&msg.transaction_id);
            if !known {
                continue;
            }
            *shared.last_seen.lock().unwrap() = Instant::now();
            shared.select_pair(&socket, from);
        }
    }
}

/// Send binding checks to every remote candidate until connected, then
/// keepalives to the selected pair.
async fn check_loop(shared: Arc<Shared>, sockets: Vec<Arc<UdpSocket>>, remote_ufrag: String) {
    let username = format!("{}:{}", remote_ufrag, shared.local_ufrag);
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let selected = shared.selected.lock().unwrap().clone();
        match selected {
            Some((socket, peer)) => {
                send_check(&shared, &socket, peer, &username).await;
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(shared.config.keepalive_interval) => {}
                }
            }
            None => {
                let targets = shared.remote_candidates.lock().unwrap().clone();
                if targets.is_empty() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = shared.remote_added.notified() => continue,
                    }
                }
                for (addr, _prio) in &targets {
                    for socket in &sockets {
                        let local = match socket.local_addr() {
                            Ok(a) => a,
                            Err(_) => continue,
                        };
                        if local.is_ipv4() != addr.is_ipv4() {
                            continue;
                        }
                        send_check(&shared, socket, *addr, &username).await;
                    }
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(shared.config.check_interval) => {}
                }
            }
        }
    }
}

async fn send_check(shared: &Shared, socket: &UdpSocket, to: SocketAddr, username: &str) {
    let mut req = StunMessage::binding_request();
    req.add_username(username);
    {
        let mut pending = shared.pending_checks.lock().unwrap();
        // Transactions this old can no longer be answered; drop them
        // wholesale rather than tracking ages.
        if pending.len() >= 4096 {
            pending.clear();
        }
        pending.insert(req.transaction_id);
    }
    if let Err(e) = socket.send_to(&req.encode(), to).await {
        debug!(%to, error = %e, "check send failed");
    }
}

/// Watch the liveness clock once connected: quiet pairs degrade to
/// `Disconnected`, then `Failed`; traffic restores `Connected`.
async fn liveness_loop(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {}
        }
        if shared.selected.lock().unwrap().is_none() {
            continue;
        }
        let quiet = shared.last_seen.lock().unwrap().elapsed();
        let state = *shared.state_tx.borrow();
        if quiet >= shared.config.failed_timeout {
            shared.set_state(ConnectionState::Failed);
            return;
        }
        if quiet >= shared.config.disconnected_timeout {
            shared.set_state(ConnectionState::Disconnected);
        } else if state == ConnectionState::Disconnected {
            shared.set_state(ConnectionState::Connected);
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
