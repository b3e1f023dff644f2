//! Core proxy module
//!
//! This module contains the proxy machinery:
//! - Packet framing
//! - Hook registry and plugin trait
//! - Session state and lifecycle
//! - Per-socket peers and the forwarding loop

pub mod codec;
pub mod forward;
pub mod hooks;
pub mod peer;
mod server;
pub mod session;
pub mod stats;

pub use codec::{Packet, PacketCodec};
pub use forward::run_forwarder;
pub use hooks::{hook, Hook, HookKey, HookRegistry, PacketHook, Plugin};
pub use peer::{Peer, PeerConfig, Side};
pub use server::{Proxy, ProxyBuilder, ProxyHandle};
pub use session::{Phase, ReconnectMode, Session, SessionInfo, Target};
pub use stats::{ForwardStats, StatsSnapshot};
