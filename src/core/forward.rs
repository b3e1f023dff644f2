//! Packet forwarding loop
//!
//! Runs while the session is active: waits on both peers at once, frames one
//! packet, runs its hook chain, and relays the result to the opposite peer.
//! Peers are captured once per active pair, so a socket swapped out by a
//! reconnect is never written to after the swap is observed.

use std::sync::Arc;

use super::codec::Packet;
use super::hooks::HookRegistry;
use super::peer::{Peer, Side};
use super::session::{ActivePair, Session};
use super::stats::ForwardStats;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Forward packets until the session is killed
pub async fn run_forwarder(
    session: Arc<Session>,
    hooks: Arc<HookRegistry>,
    stats: Arc<ForwardStats>,
) {
    loop {
        let Some(pair) = session.wait_active().await else {
            break;
        };
        log::debug!(
            generation = pair.generation,
            client = %pair.client.addr(),
            server = %pair.server.addr(),
            "Forwarding started"
        );
        forward_pair(&session, &hooks, &stats, &pair).await;
    }
    log::info!("Forwarder stopped");
}

async fn forward_pair(
    session: &Session,
    hooks: &HookRegistry,
    stats: &ForwardStats,
    pair: &ActivePair,
) {
    loop {
        let (from, result) = tokio::select! {
            biased;
            _ = session.wait_superseded(pair.generation) => {
                log::debug!(generation = pair.generation, "Forwarding paused");
                return;
            }
            res = pair.client.read_packet() => (Side::Client, res),
            res = pair.server.read_packet() => (Side::Server, res),
        };

        let outcome = match result {
            Ok(packet) => relay_packet(hooks, stats, from, packet, pair.peer(from.opposite())).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            report_failure(from, &e);
            if session.peer_lost(pair.generation) {
                log::info!(side = %from, "Peer lost, waiting for client to reconnect");
            }
            return;
        }
    }
}

/// Run hooks for one packet and queue the result on `to`
///
/// An empty hook result drops the packet: nothing is written to `to`.
pub async fn relay_packet(
    hooks: &HookRegistry,
    stats: &ForwardStats,
    from: Side,
    packet: Packet,
    to: &Peer,
) -> Result<()> {
    let id = packet.id();
    let data = if hooks.is_hooked(id) {
        hooks.dispatch(id, packet.into_bytes())
    } else {
        packet.into_bytes()
    };

    if data.is_empty() {
        stats.record_drop();
        log::trace!(from = %from, packet = id, "Packet dropped by hook");
        return Ok(());
    }

    stats.record_forward(from, data.len());
    to.send(data).await
}

fn report_failure(from: Side, err: &ProxyError) {
    match err {
        ProxyError::MalformedPacket(reason) => {
            log::warn!(side = %from, reason = %reason, "Malformed packet, dropping connection");
        }
        e if e.is_disconnect() => {
            log::info!(side = %from, error = %e, "Connection closed");
        }
        e => {
            log::warn!(side = %from, error = %e, "Connection error");
        }
    }
}
