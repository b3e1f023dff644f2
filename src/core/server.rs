//! Core proxy
//!
//! The Proxy struct ties the session, the hook registry and the counters
//! together. Plugins are constructed by the builder with a [`ProxyHandle`].

use bytes::Bytes;
use std::sync::Arc;

use super::hooks::{HookRegistry, Plugin};
use super::peer::Side;
use super::session::{ReconnectMode, Session, SessionInfo, Target};
use super::stats::ForwardStats;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Core proxy
pub struct Proxy {
    /// Shared session state
    pub session: Arc<Session>,
    /// Hook table, fixed after build
    pub hooks: Arc<HookRegistry>,
    /// Forwarding counters
    pub stats: Arc<ForwardStats>,
    /// Runtime configuration
    pub config: ProxyConfig,
}

impl Proxy {
    /// Create a new proxy builder
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// Handle with the same capabilities plugins get
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            session: Arc::clone(&self.session),
        }
    }
}

/// Plugin-facing view of a running proxy
///
/// Reads session state, injects packets on either side, and applies reconnect
/// directives. Cheap to clone.
#[derive(Clone)]
pub struct ProxyHandle {
    session: Arc<Session>,
}

impl ProxyHandle {
    pub fn info(&self) -> SessionInfo {
        self.session.info()
    }

    /// Address the game client connects to
    pub fn local_target(&self) -> Target {
        self.session.info().local
    }

    /// Queue a raw packet for the game client
    pub fn send_to_client(&self, packet: Bytes) -> Result<()> {
        self.send(Side::Client, packet)
    }

    /// Queue a raw packet for the game server
    pub fn send_to_server(&self, packet: Bytes) -> Result<()> {
        self.send(Side::Server, packet)
    }

    /// Queue a raw packet on `side` without waiting
    ///
    /// Safe to call from inside a hook; the packet is written before anything
    /// the hook's own result produces for the same side.
    pub fn send(&self, side: Side, packet: Bytes) -> Result<()> {
        match self.session.peer(side) {
            Some(peer) => peer.try_send(packet),
            None => Err(ProxyError::ConnectionClosed),
        }
    }

    /// Move the upstream to `target` without dropping the client
    pub fn reconnect(&self, target: Target, mode: ReconnectMode) -> Result<()> {
        log::info!(target = %target, mode = ?mode, "Reconnect requested");
        if self.session.request_reconnect(target, mode) {
            Ok(())
        } else {
            Err(ProxyError::Killed)
        }
    }

    /// Stop all loops and close both sockets
    pub fn shutdown(&self) {
        if self.session.kill() {
            log::info!("Shutting down...");
        }
    }
}

type PluginFactory = Box<dyn FnOnce(ProxyHandle) -> Box<dyn Plugin>>;

/// Builder for constructing a Proxy
pub struct ProxyBuilder {
    config: Option<ProxyConfig>,
    remote: Option<Target>,
    plugins: Vec<PluginFactory>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyBuilder {
    /// Create a new proxy builder
    pub fn new() -> Self {
        Self {
            config: None,
            remote: None,
            plugins: Vec::new(),
        }
    }

    /// Set runtime configuration
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the initial upstream target
    pub fn remote(mut self, target: Target) -> Self {
        self.remote = Some(target);
        self
    }

    /// Add a plugin; plugins load in the order they are added
    pub fn plugin<P, F>(mut self, factory: F) -> Self
    where
        P: Plugin + 'static,
        F: FnOnce(ProxyHandle) -> P + 'static,
    {
        self.plugins
            .push(Box::new(move |handle| Box::new(factory(handle)) as Box<dyn Plugin>));
        self
    }

    /// Build the proxy, instantiating plugins and the hook table
    pub fn build(self) -> Result<Proxy> {
        let config = self
            .config
            .ok_or_else(|| ProxyError::Config("proxy config is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| ProxyError::Config("initial remote target is required".to_string()))?;

        let session = Arc::new(Session::new(Target::from(config.listen_addr), remote));
        let handle = ProxyHandle {
            session: Arc::clone(&session),
        };

        let plugins: Vec<Box<dyn Plugin>> = self
            .plugins
            .into_iter()
            .map(|factory| factory(handle.clone()))
            .collect();
        let hooks = HookRegistry::build(&plugins);

        Ok(Proxy {
            session,
            hooks: Arc::new(hooks),
            stats: Arc::new(ForwardStats::new()),
            config,
        })
    }
}
