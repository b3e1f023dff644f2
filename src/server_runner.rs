//! Listener and connector loops
//!
//! This module binds the local listener and runs the three proxy loops:
//! accepting clients, dialing the upstream, and forwarding packets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ProxyConfig;
use crate::core::{run_forwarder, Peer, Proxy, Session, Side, StatsSnapshot, Target};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the client listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(config: &ProxyConfig) -> Result<TcpListener> {
    let addr = config.listen_addr;
    bind_socket(addr, config.tcp_backlog).map_err(|source| ProxyError::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn bind_socket(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

/// Accept clients until the session is killed
///
/// Every accepted socket replaces the currently attached client.
pub async fn run_listener(session: Arc<Session>, listener: TcpListener, config: ProxyConfig) {
    let shutdown = session.shutdown_token();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, addr)) => {
                if config.tcp_nodelay {
                    let _ = stream.set_nodelay(true);
                }
                log::connection("client", &addr.to_string(), "accepted");
                let peer = Arc::new(Peer::spawn(stream, addr, Side::Client, config.peer_config()));
                if !session.attach_client(peer) {
                    break;
                }
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    log::info!("Listener stopped");
}

/// Dial the upstream whenever a client is attached without one
///
/// A failed or timed out dial closes the client; the core does not retry.
pub async fn run_connector(session: Arc<Session>, config: ProxyConfig) {
    let shutdown = session.shutdown_token();
    while let Some(target) = session.begin_connect().await {
        log::info!(target = %target, "Connecting to server");

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = dial(&target, &config) => res,
        };

        match result {
            Ok((stream, addr)) => {
                let peer = Arc::new(Peer::spawn(stream, addr, Side::Server, config.peer_config()));
                match session.complete_connect(&target, peer) {
                    Ok(()) => log::connection("server", &addr.to_string(), "connected"),
                    Err(stale) => {
                        log::debug!(target = %target, "Session moved on while dialing, discarding socket");
                        stale.close();
                    }
                }
            }
            Err(e) => {
                log::warn!(target = %target, error = %e, "Failed to connect to server, dropping client");
                session.fail_connect();
            }
        }
    }
    log::info!("Connector stopped");
}

async fn dial(target: &Target, config: &ProxyConfig) -> Result<(TcpStream, SocketAddr)> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let stream = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::Connect {
                target: target.clone(),
                source,
            })
        }
        Err(_) => return Err(ProxyError::ConnectTimeout(target.clone())),
    };
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let addr = stream.peer_addr()?;
    Ok((stream, addr))
}

/// Run the proxy until it is shut down, returning the final counters
pub async fn run_proxy(proxy: Proxy, listener: TcpListener) -> Result<StatsSnapshot> {
    let local_addr = listener.local_addr()?;
    proxy.session.set_local(Target::from(local_addr));

    log::info!(
        address = %local_addr,
        remote = %proxy.session.info().remote,
        hooks = proxy.hooks.hook_count(),
        "Proxy started"
    );

    let listener_task = tokio::spawn(run_listener(
        Arc::clone(&proxy.session),
        listener,
        proxy.config.clone(),
    ));
    let connector_task = tokio::spawn(run_connector(
        Arc::clone(&proxy.session),
        proxy.config.clone(),
    ));
    let forwarder_task = tokio::spawn(run_forwarder(
        Arc::clone(&proxy.session),
        Arc::clone(&proxy.hooks),
        Arc::clone(&proxy.stats),
    ));

    let (listener_res, connector_res, forwarder_res) =
        tokio::join!(listener_task, connector_task, forwarder_task);
    for res in [listener_res, connector_res, forwarder_res] {
        if let Err(e) = res {
            log::error!(error = %e, "Proxy task failed");
        }
    }
    // A panicked loop must not leave the others running
    proxy.session.kill();

    let snapshot = proxy.stats.snapshot();
    log::info!(
        upstream_packets = snapshot.upstream_packets,
        upstream_bytes = snapshot.upstream_bytes,
        downstream_packets = snapshot.downstream_packets,
        downstream_bytes = snapshot.downstream_bytes,
        dropped = snapshot.dropped,
        hook_failures = proxy.hooks.failure_count(),
        "Proxy stopped"
    );
    Ok(snapshot)
}
