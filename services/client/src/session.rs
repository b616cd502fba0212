//! Per-peer negotiation session.
//!
//! One session drives one directional attempt to reach a named peer: it
//! subscribes to the peer's topic, advertises its ICE credentials with
//! exponential backoff while idle, exchanges candidates through the broker,
//! and hands the agent to `dial` or `accept` once both sides have produced a
//! candidate. A credentials message that differs from the stored pair
//! restarts the agent while preserving session identity.
//!
//! All mutable session state is owned by the single `run` task; every
//! inbound event (broker frame, agent event, timer, shutdown) funnels
//! through its `select!` loop, so transitions never race.

use crate::signal::{SignalError, SignalingClient, SubscribeStream};
use kh_ice::{Agent, AgentConfig, AgentEvent, ConnectionState, IceError};
use kh_proto::Credentials;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const INITIAL_ADVERTISE_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_ADVERTISE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Creating,
    Idle,
    Gathering,
    GatheringLocal,
    GatheringRemote,
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Restarting,
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("restart not allowed in state {0:?}")]
    InvalidState(SessionState),
    #[error("signaling: {0}")]
    Signal(#[from] SignalError),
    #[error("ICE: {0}")]
    Ice(#[from] IceError),
}

/// Restart is illegal from terminal or already-restarting states.
pub(crate) fn restart_allowed(state: SessionState) -> Result<(), SessionError> {
    match state {
        SessionState::Closed | SessionState::Closing | SessionState::Restarting => {
            Err(SessionError::InvalidState(state))
        }
        _ => Ok(()),
    }
}

/// Deterministic, symmetric role assignment: both hostnames are read as
/// big-endian byte integers and the smaller one dials. Leading NUL bytes are
/// insignificant, a shorter string is the smaller integer, and equal-length
/// strings compare bytewise.
pub fn is_controlling(source: &str, target: &str) -> bool {
    fn significant(bytes: &[u8]) -> &[u8] {
        let start = bytes.iter().take_while(|b| **b == 0).count();
        &bytes[start..]
    }
    let ours = significant(source.as_bytes());
    let theirs = significant(target.as_bytes());
    if ours.len() != theirs.len() {
        return ours.len() < theirs.len();
    }
    ours < theirs
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local hostname; outbound messages publish on this topic.
    pub source: String,
    /// Peer hostname; the session subscribes to this topic.
    pub target: String,
    pub agent: AgentConfig,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SessionConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        SessionConfig {
            source: source.into(),
            target: target.into(),
            agent: AgentConfig::default(),
            initial_backoff: INITIAL_ADVERTISE_BACKOFF,
            max_backoff: MAX_ADVERTISE_BACKOFF,
        }
    }
}

/// Read-only view used by callers and tests.
pub struct SessionMonitor {
    state_rx: watch::Receiver<SessionState>,
    restarts: Arc<AtomicU32>,
}

impl SessionMonitor {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Block until the session reaches `target` (or the session ends).
    pub async fn wait_for(&mut self, target: SessionState) {
        loop {
            if *self.state_rx.borrow() == target {
                return;
            }
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Session {
    cfg: SessionConfig,
    signaling: Arc<SignalingClient>,
    state_tx: watch::Sender<SessionState>,
    restarts: Arc<AtomicU32>,
}

impl Session {
    pub fn new(cfg: SessionConfig, signaling: Arc<SignalingClient>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Closed);
        Session {
            cfg,
            signaling,
            state_tx,
            restarts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            state_rx: self.state_tx.subscribe(),
            restarts: Arc::clone(&self.restarts),
        }
    }

    pub fn is_controlling(&self) -> bool {
        is_controlling(&self.cfg.source, &self.cfg.target)
    }

    fn set_state(&self, state: &mut SessionState, next: SessionState) {
        if *state != next {
            debug!(
                source = %self.cfg.source,
                target = %self.cfg.target,
                from = ?*state,
                to = ?next,
                "session transition"
            );
            *state = next;
            let _ = self.state_tx.send(next);
        }
    }

    async fn advertise(&self, agent: &Agent, need_creds: bool) {
        let mut creds = agent.local_credentials();
        creds.need_creds = need_creds;
        if let Err(e) = self
            .signaling
            .publish_credentials(&self.cfg.source, creds)
            .await
        {
            warn!(target = %self.cfg.target, error = %e, "failed to advertise credentials");
        }
    }

    /// Reopen the subscription after the stream ended. Returns `None` once
    /// shutdown is requested.
    async fn resubscribe(
        &self,
        subscriber: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SubscribeStream> {
        let mut backoff = self.cfg.initial_backoff;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.signaling.subscribe_as(&self.cfg.target, subscriber).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!(topic = %self.cfg.target, error = %e, "subscribe failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.cfg.max_backoff);
                }
            }
        }
    }

    fn spawn_connect(
        &self,
        agent: &Arc<Agent>,
        remote: &Credentials,
    ) -> JoinHandle<()> {
        let agent = Arc::clone(agent);
        let ufrag = remote.ufrag.clone();
        let pwd = remote.pwd.clone();
        let controlling = self.is_controlling();
        let source = self.cfg.source.clone();
        let target = self.cfg.target.clone();
        tokio::spawn(async move {
            let result = if controlling {
                debug!(%source, %target, "dialing");
                agent.dial(ufrag, pwd).await
            } else {
                debug!(%source, %target, "accepting");
                agent.accept(ufrag, pwd).await
            };
            match result {
                Ok(conn) => info!(
                    %source,
                    %target,
                    local = %conn.local_addr(),
                    peer = %conn.peer_addr(),
                    "connectivity established"
                ),
                Err(e) => warn!(%source, %target, error = %e, "connectivity attempt ended"),
            }
        })
    }

    /// Drive the session until shutdown. The passed watch is the session's
    /// death signal: once it turns true the agent is closed and every task
    /// unwinds. Returning on shutdown is not an error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let subscriber = format!("{}/{}", self.cfg.source, self.cfg.target);
        let mut state = SessionState::Closed;
        self.set_state(&mut state, SessionState::Creating);

        let mut agent = Arc::new(Agent::new(self.cfg.agent.clone()));
        let mut agent_events = agent.take_events().expect("fresh agent has events");

        let Some(mut stream) = self.resubscribe(&subscriber, &mut shutdown).await else {
            self.set_state(&mut state, SessionState::Closed);
            return Ok(());
        };
        self.set_state(&mut state, SessionState::Idle);

        // First advertisement solicits an answer.
        self.advertise(&agent, true).await;
        let mut backoff = self.cfg.initial_backoff;
        let mut next_advertise = tokio::time::Instant::now() + backoff;

        let mut remote_creds: Option<Credentials> = None;
        let mut connect_task: Option<JoinHandle<()>> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}

                _ = tokio::time::sleep_until(next_advertise),
                    if state == SessionState::Idle =>
                {
                    self.advertise(&agent, true).await;
                    backoff = (backoff * 2).min(self.cfg.max_backoff);
                    next_advertise = tokio::time::Instant::now() + backoff;
                }

                msg = stream.next_message() => {
                    let Some(msg) = msg else {
                        warn!(topic = %self.cfg.target, "subscription stream ended");
                        match self.resubscribe(&subscriber, &mut shutdown).await {
                            Some(s) => stream = s,
                            None => break,
                        }
                        continue;
                    };

                    if let Some(creds) = msg.credentials {
                        let is_restart = remote_creds.as_ref().is_some_and(|old| {
                            !old.ufrag.is_empty()
                                && !old.pwd.is_empty()
                                && !creds.ufrag.is_empty()
                                && (old.ufrag != creds.ufrag || old.pwd != creds.pwd)
                        });

                        if is_restart {
                            if let Err(e) = restart_allowed(state) {
                                error!(target = %self.cfg.target, error = %e, "ignoring restart");
                                continue;
                            }
                            info!(target = %self.cfg.target, "remote credentials changed, restarting");
                            self.set_state(&mut state, SessionState::Restarting);
                            if let Some(task) = connect_task.take() {
                                task.abort();
                            }
                            agent.close();
                            agent = Arc::new(Agent::new(self.cfg.agent.clone()));
                            agent_events = agent.take_events().expect("fresh agent has events");
                            remote_creds = None;
                            self.restarts.fetch_add(1, Ordering::SeqCst);
                            self.set_state(&mut state, SessionState::Creating);
                            self.set_state(&mut state, SessionState::Idle);
                            backoff = self.cfg.initial_backoff;
                            next_advertise = tokio::time::Instant::now() + backoff;
                        }

                        if matches!(state, SessionState::Closed | SessionState::Closing) {
                            continue;
                        }

                        let solicited = creds.need_creds;
                        remote_creds = Some(creds);

                        if state == SessionState::Idle {
                            self.set_state(&mut state, SessionState::Gathering);
                            let gather_agent = Arc::clone(&agent);
                            let target = self.cfg.target.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gather_agent.gather().await {
                                    error!(%target, error = %e, "candidate gathering failed");
                                }
                            });
                        }

                        if solicited {
                            // Answer exactly once, without re-soliciting.
                            self.advertise(&agent, false).await;
                        }
                    }

                    if let Some(candidate) = msg.candidate {
                        if matches!(state, SessionState::Closed | SessionState::Closing) {
                            continue;
                        }
                        match agent.add_remote_candidate(&candidate) {
                            Ok(()) => {
                                debug!(target = %self.cfg.target, address = %candidate.address, "remote candidate added");
                                match state {
                                    SessionState::Gathering => {
                                        self.set_state(&mut state, SessionState::GatheringLocal);
                                    }
                                    SessionState::GatheringRemote => {
                                        self.set_state(&mut state, SessionState::Connecting);
                                        if let Some(remote) = &remote_creds {
                                            connect_task = Some(self.spawn_connect(&agent, remote));
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            Err(e) => {
                                // The pair will simply not form.
                                warn!(target = %self.cfg.target, error = %e, "dropping remote candidate");
                            }
                        }
                    }
                }

                event = agent_events.recv() => {
                    let Some(event) = event else { continue; };
                    match event {
                        AgentEvent::Candidate(candidate) => {
                            if let Err(e) = self
                                .signaling
                                .publish_candidate(&self.cfg.source, candidate)
                                .await
                            {
                                warn!(target = %self.cfg.target, error = %e, "failed to send candidate");
                            }
                            match state {
                                SessionState::Gathering => {
                                    self.set_state(&mut state, SessionState::GatheringRemote);
                                }
                                SessionState::GatheringLocal => {
                                    self.set_state(&mut state, SessionState::Connecting);
                                    if let Some(remote) = &remote_creds {
                                        connect_task = Some(self.spawn_connect(&agent, remote));
                                    }
                                }
                                _ => {}
                            }
                        }
                        AgentEvent::StateChange(agent_state) => {
                            match agent_state {
                                ConnectionState::Connected => {
                                    if !matches!(state, SessionState::Closed | SessionState::Closing) {
                                        self.set_state(&mut state, SessionState::Connected);
                                    }
                                }
                                ConnectionState::Failed => {
                                    self.set_state(&mut state, SessionState::Failed);
                                }
                                ConnectionState::Disconnected => {
                                    self.set_state(&mut state, SessionState::Disconnected);
                                }
                                ConnectionState::New
                                | ConnectionState::Checking
                                | ConnectionState::Closed => {}
                            }
                        }
                    }
                }
            }
        }

        // Cancellation: close the agent and unwind.
        self.set_state(&mut state, SessionState::Closing);
        if let Some(task) = connect_task.take() {
            task.abort();
        }
        agent.close();
        if let Err(e) = self
            .signaling
            .unsubscribe_as(&self.cfg.target, &subscriber)
            .await
        {
            debug!(target = %self.cfg.target, error = %e, "unsubscribe on shutdown failed");
        }
        self.set_state(&mut state, SessionState::Closed);
        Ok(())
    }
}
