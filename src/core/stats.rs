//! Forwarding counters

use std::sync::atomic::{AtomicU64, Ordering};

use super::peer::Side;

/// Packet and byte counters for both directions
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Client -> server packets
    upstream_packets: AtomicU64,
    upstream_bytes: AtomicU64,
    /// Server -> client packets
    downstream_packets: AtomicU64,
    downstream_bytes: AtomicU64,
    /// Packets vetoed by a hook
    dropped: AtomicU64,
}

/// Point-in-time copy of [`ForwardStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub upstream_packets: u64,
    pub upstream_bytes: u64,
    pub downstream_packets: u64,
    pub downstream_bytes: u64,
    pub dropped: u64,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet read from `from` and relayed to the other side
    #[inline]
    pub fn record_forward(&self, from: Side, bytes: usize) {
        let (packets, total) = match from {
            Side::Client => (&self.upstream_packets, &self.upstream_bytes),
            Side::Server => (&self.downstream_packets, &self.downstream_bytes),
        };
        packets.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            upstream_packets: self.upstream_packets.load(Ordering::Relaxed),
            upstream_bytes: self.upstream_bytes.load(Ordering::Relaxed),
            downstream_packets: self.downstream_packets.load(Ordering::Relaxed),
            downstream_bytes: self.downstream_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
