//! Hook traits and the per-packet dispatch table
//!
//! Plugins contribute hooks keyed by packet id or by the global bucket. The
//! registry is built once before forwarding starts and is read-only afterwards.

use bytes::Bytes;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ProxyError;
use crate::logger::log;

/// Number of distinct packet ids
pub const PACKET_ID_COUNT: usize = 256;

/// Hook transforming or vetoing one packet
///
/// Receives the complete wire form and the packet id. Returning an empty buffer
/// drops the packet and stops the chain. The returned bytes are forwarded as-is,
/// so a hook that synthesizes a packet is responsible for its length prefix.
pub trait PacketHook: Send + Sync {
    fn on_packet(&self, packet: Bytes, id: u8) -> Result<Bytes, ProxyError>;
}

impl<F> PacketHook for F
where
    F: Fn(Bytes, u8) -> Result<Bytes, ProxyError> + Send + Sync,
{
    fn on_packet(&self, packet: Bytes, id: u8) -> Result<Bytes, ProxyError> {
        self(packet, id)
    }
}

/// Shared hook handle
pub type Hook = Arc<dyn PacketHook>;

/// Wrap a closure as a [`Hook`]
pub fn hook<F>(f: F) -> Hook
where
    F: Fn(Bytes, u8) -> Result<Bytes, ProxyError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Bucket a hook is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKey {
    /// Runs for this packet id only
    Packet(u8),
    /// Runs for every packet, after the id-specific hooks
    Global,
}

impl fmt::Display for HookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKey::Packet(id) => write!(f, "{}", id),
            HookKey::Global => write!(f, "*"),
        }
    }
}

/// Capability implemented by every plugin
pub trait Plugin: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Hooks in registration order
    fn hooks(&self) -> Vec<(HookKey, Hook)>;
}

/// Fixed table of hook chains indexed by packet id, plus the global chain
pub struct HookRegistry {
    by_id: Vec<Vec<Hook>>,
    global: Vec<Hook>,
    has_global: bool,
    failures: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            by_id: (0..PACKET_ID_COUNT).map(|_| Vec::new()).collect(),
            global: Vec::new(),
            has_global: false,
            failures: AtomicU64::new(0),
        }
    }

    /// Collect hooks from plugins in load order
    pub fn build(plugins: &[Box<dyn Plugin>]) -> Self {
        let mut registry = Self::new();

        for plugin in plugins {
            log::info!(plugin = plugin.name(), "Loading plugin");
            let hooks = plugin.hooks();
            let count = hooks.len();
            for (key, hook) in hooks {
                registry.register(key, hook);
                log::hook_registered(plugin.name(), &key.to_string());
            }
            log::info!(plugin = plugin.name(), hooks = count, "Plugin loaded");
        }

        log::info!(
            hooks = registry.hook_count(),
            plugins = plugins.len(),
            "Finished loading plugins"
        );
        registry
    }

    /// Append a hook to the chain for `key`
    pub fn register(&mut self, key: HookKey, hook: Hook) {
        match key {
            HookKey::Packet(id) => self.by_id[id as usize].push(hook),
            HookKey::Global => {
                self.global.push(hook);
                self.has_global = true;
            }
        }
    }

    /// Whether `dispatch` could change this packet at all
    #[inline]
    pub fn is_hooked(&self, id: u8) -> bool {
        self.has_global || !self.by_id[id as usize].is_empty()
    }

    /// Run the id-specific chain, then the global chain
    ///
    /// Each hook receives the previous hook's output. An empty result stops the
    /// chain immediately and is returned as the drop signal. A hook that errors
    /// or panics is treated as having returned its input unchanged.
    pub fn dispatch(&self, id: u8, packet: Bytes) -> Bytes {
        let mut current = packet;
        for hook in self.by_id[id as usize].iter().chain(self.global.iter()) {
            current = self.run_hook(hook, id, current);
            if current.is_empty() {
                break;
            }
        }
        current
    }

    fn run_hook(&self, hook: &Hook, id: u8, input: Bytes) -> Bytes {
        match catch_unwind(AssertUnwindSafe(|| hook.on_packet(input.clone(), id))) {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(packet = id, error = %e, "Hook failed, forwarding its input unchanged");
                input
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(packet = id, "Hook panicked, forwarding its input unchanged");
                input
            }
        }
    }

    /// Total registered hooks across all buckets
    pub fn hook_count(&self) -> usize {
        self.by_id.iter().map(Vec::len).sum::<usize>() + self.global.len()
    }

    /// Ids with at least one specific hook
    pub fn hooked_ids(&self) -> Vec<u8> {
        (0..PACKET_ID_COUNT)
            .filter(|&id| !self.by_id[id].is_empty())
            .map(|id| id as u8)
            .collect()
    }

    pub fn has_global(&self) -> bool {
        self.has_global
    }

    /// Hooks that faulted since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
