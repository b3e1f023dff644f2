//! Packet logging
//!
//! Global hook that records the id and size of every packet passing through.
//! Traffic is never modified.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{hook, Hook, HookKey, Plugin};
use crate::logger::log;

pub struct PacketLogPlugin {
    filter: Arc<HashSet<u8>>,
}

impl PacketLogPlugin {
    /// Log every packet except the ids in `filter`
    pub fn new(filter: impl IntoIterator<Item = u8>) -> Self {
        Self {
            filter: Arc::new(filter.into_iter().collect()),
        }
    }

    pub fn is_filtered(&self, id: u8) -> bool {
        self.filter.contains(&id)
    }
}

impl Plugin for PacketLogPlugin {
    fn name(&self) -> &str {
        "packet_log"
    }

    fn hooks(&self) -> Vec<(HookKey, Hook)> {
        let filter = Arc::clone(&self.filter);
        vec![(
            HookKey::Global,
            hook(move |packet, id| {
                if !filter.contains(&id) {
                    log::debug!(packet = id, len = packet.len(), "Packet");
                }
                Ok(packet)
            }),
        )]
    }
}
