//! Session state and the connection lifecycle
//!
//! All lifecycle flags and both socket slots live in one value behind a
//! `watch` channel. Every transition is a single `send_modify` /
//! `send_if_modified`, and every blocking wait is a `wait_for` on that channel,
//! so readers always observe the socket pair and flags from one transition.
//!
//! ```text
//! Idle -> ClientAttached -> ServerConnecting -> Active
//!                                 ^                |
//!                                 |           (directive)
//!                                 +--------- Reconnecting
//! any -> Killed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::peer::{Peer, Side};

/// Host and port of one end of the proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Lifecycle phase derived from the session flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ClientAttached,
    ServerConnecting,
    Active,
    Reconnecting,
    Killed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::ClientAttached => "client_attached",
            Phase::ServerConnecting => "server_connecting",
            Phase::Active => "active",
            Phase::Reconnecting => "reconnecting",
            Phase::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// How the upstream is re-established after a reconnect directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Dial the new target right away, keeping the attached client
    Seamless,
    /// Dial only after the client has re-attached to the proxy
    #[default]
    AwaitClient,
}

#[derive(Debug)]
struct SessionState {
    local: Target,
    remote: Target,
    client: Option<Arc<Peer>>,
    server: Option<Arc<Peer>>,
    connected: bool,
    reconnecting: bool,
    await_client: bool,
    connecting: bool,
    killed: bool,
    generation: u64,
}

impl SessionState {
    fn phase(&self) -> Phase {
        if self.killed {
            Phase::Killed
        } else if self.connected {
            Phase::Active
        } else if self.connecting {
            Phase::ServerConnecting
        } else if self.reconnecting {
            Phase::Reconnecting
        } else if self.client.is_some() {
            Phase::ClientAttached
        } else {
            Phase::Idle
        }
    }

    fn ready_to_connect(&self) -> bool {
        !self.killed
            && !self.connecting
            && !self.await_client
            && self.client.is_some()
            && self.server.is_none()
    }

    /// Graceful: anything already queued for the peer is still written
    fn drop_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.close();
        }
        self.connected = false;
    }

    fn drop_client(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.connected = false;
    }
}

/// Plain-data view of the session for plugins and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub local: Target,
    pub remote: Target,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub connected: bool,
    pub reconnecting: bool,
    pub killed: bool,
    pub phase: Phase,
    pub generation: u64,
}

/// Both peers captured under one transition
#[derive(Debug, Clone)]
pub struct ActivePair {
    pub generation: u64,
    pub client: Arc<Peer>,
    pub server: Arc<Peer>,
}

impl ActivePair {
    pub fn peer(&self, side: Side) -> &Arc<Peer> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }
}

/// Shared, synchronized session record
#[derive(Debug)]
pub struct Session {
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(local: Target, remote: Target) -> Self {
        let (state, _) = watch::channel(SessionState {
            local,
            remote,
            client: None,
            server: None,
            connected: false,
            reconnecting: false,
            await_client: false,
            connecting: false,
            killed: false,
            generation: 0,
        });
        Self {
            state,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let s = self.state.borrow();
        SessionInfo {
            local: s.local.clone(),
            remote: s.remote.clone(),
            client_addr: s.client.as_ref().map(|p| p.addr()),
            server_addr: s.server.as_ref().map(|p| p.addr()),
            connected: s.connected,
            reconnecting: s.reconnecting,
            killed: s.killed,
            phase: s.phase(),
            generation: s.generation,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase()
    }

    /// Token cancelled once the session is killed
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current peer on `side`, if attached
    pub fn peer(&self, side: Side) -> Option<Arc<Peer>> {
        let s = self.state.borrow();
        match side {
            Side::Client => s.client.clone(),
            Side::Server => s.server.clone(),
        }
    }

    /// Record the address the listener actually bound
    pub fn set_local(&self, local: Target) {
        self.state.send_modify(|s| s.local = local);
    }

    /// Listener accepted a client: replace the previous one
    ///
    /// Returns false if the session is already killed, in which case the peer
    /// has been closed.
    pub fn attach_client(&self, peer: Arc<Peer>) -> bool {
        let mut accepted = false;
        self.state.send_modify(|s| {
            if s.killed {
                peer.close();
                return;
            }
            if let Some(old) = s.client.replace(Arc::clone(&peer)) {
                old.close();
            }
            s.reconnecting = false;
            s.await_client = false;
            s.generation += 1;
            accepted = true;
        });
        accepted
    }

    /// Block until a client is attached and no upstream exists, then claim the
    /// connect slot. Returns `None` once killed.
    pub async fn begin_connect(&self) -> Option<Target> {
        let mut rx = self.state.subscribe();
        loop {
            let mut target = None;
            self.state.send_if_modified(|s| {
                if s.ready_to_connect() {
                    s.connecting = true;
                    target = Some(s.remote.clone());
                    true
                } else {
                    false
                }
            });
            if let Some(target) = target {
                return Some(target);
            }
            if self.state.borrow().killed {
                return None;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Install a freshly dialed upstream and go active
    ///
    /// Hands the peer back if the session moved on while dialing (killed,
    /// client gone, or target changed).
    pub fn complete_connect(&self, target: &Target, peer: Arc<Peer>) -> Result<(), Arc<Peer>> {
        let mut rejected = None;
        self.state.send_modify(|s| {
            s.connecting = false;
            if s.killed || s.client.is_none() || s.remote != *target {
                rejected = Some(Arc::clone(&peer));
                return;
            }
            if let Some(old) = s.server.replace(Arc::clone(&peer)) {
                old.close();
            }
            s.connected = true;
            s.reconnecting = false;
            s.generation += 1;
        });
        match rejected {
            Some(peer) => Err(peer),
            None => Ok(()),
        }
    }

    /// Dial failed: release the connect slot and close the client
    pub fn fail_connect(&self) {
        self.state.send_modify(|s| {
            s.connecting = false;
            s.reconnecting = false;
            s.await_client = false;
            s.drop_client();
            s.generation += 1;
        });
    }

    /// Apply a reconnect directive
    ///
    /// Retargets the upstream, closes the current server socket, and lets the
    /// connector dial again. The client stays attached.
    pub fn request_reconnect(&self, target: Target, mode: ReconnectMode) -> bool {
        self.state.send_if_modified(|s| {
            if s.killed {
                return false;
            }
            s.remote = target;
            s.reconnecting = true;
            s.await_client = mode == ReconnectMode::AwaitClient;
            s.drop_server();
            s.generation += 1;
            true
        })
    }

    /// A peer of pair `generation` failed
    ///
    /// Ignored when the pair was already replaced. Otherwise both sockets are
    /// closed and the session waits for the client to come back.
    pub fn peer_lost(&self, generation: u64) -> bool {
        self.state.send_if_modified(|s| {
            if s.killed || s.generation != generation {
                return false;
            }
            s.drop_server();
            s.drop_client();
            s.reconnecting = true;
            s.await_client = true;
            s.generation += 1;
            true
        })
    }

    /// Block until both peers are attached and connected. `None` once killed.
    pub async fn wait_active(&self) -> Option<ActivePair> {
        let mut rx = self.state.subscribe();
        let s = rx
            .wait_for(|s| s.killed || (s.connected && s.client.is_some() && s.server.is_some()))
            .await
            .ok()?;
        if s.killed {
            return None;
        }
        match (&s.client, &s.server) {
            (Some(client), Some(server)) => Some(ActivePair {
                generation: s.generation,
                client: Arc::clone(client),
                server: Arc::clone(server),
            }),
            _ => None,
        }
    }

    /// Resolve once the pair of `generation` is no longer current
    pub async fn wait_superseded(&self, generation: u64) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| s.killed || !s.connected || s.generation != generation)
            .await;
    }

    /// Shut everything down; returns true on the first call only
    pub fn kill(&self) -> bool {
        let first = self.state.send_if_modified(|s| {
            if s.killed {
                return false;
            }
            s.killed = true;
            s.connecting = false;
            for peer in [s.server.take(), s.client.take()].into_iter().flatten() {
                peer.abort();
            }
            s.connected = false;
            s.generation += 1;
            true
        });
        self.shutdown.cancel();
        first
    }
}
