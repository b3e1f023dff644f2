//! Built-in plugins

mod packet_log;
mod reconnect;

pub use packet_log::PacketLogPlugin;
pub use reconnect::{DirectiveCodec, HostPortCodec, ReconnectPlugin};
