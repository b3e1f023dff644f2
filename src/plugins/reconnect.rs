//! Reconnect directive handling
//!
//! When the server tells the client to move to another host, the proxy follows
//! the directive itself. What the client sees depends on the mode:
//! - `Seamless`: the directive is dropped; the client keeps its connection and
//!   the proxy swaps the upstream underneath it.
//! - `AwaitClient`: the directive is rewritten to the proxy's own address, so
//!   the client reconnects to the proxy and the new upstream is dialed then.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::core::{hook, Hook, HookKey, Packet, Plugin, ProxyHandle, ReconnectMode, Target};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Payload format of a reconnect directive
pub trait DirectiveCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Target>;
    fn encode(&self, target: &Target) -> Result<Bytes>;
}

/// `[host_len: u16 LE][host: utf-8][port: u16 LE]`
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPortCodec;

impl DirectiveCodec for HostPortCodec {
    fn decode(&self, payload: &[u8]) -> Result<Target> {
        let mut buf = payload;
        if buf.remaining() < 2 {
            return Err(ProxyError::Hook("reconnect directive too short".to_string()));
        }
        let host_len = buf.get_u16_le() as usize;
        if buf.remaining() < host_len + 2 {
            return Err(ProxyError::Hook(format!(
                "reconnect directive truncated: host needs {} bytes, {} left",
                host_len,
                buf.remaining()
            )));
        }
        let host = std::str::from_utf8(&buf[..host_len])
            .map_err(|e| ProxyError::Hook(format!("reconnect host is not utf-8: {}", e)))?
            .to_string();
        buf.advance(host_len);
        let port = buf.get_u16_le();
        if host.is_empty() {
            return Err(ProxyError::Hook("reconnect directive has empty host".to_string()));
        }
        Ok(Target::new(host, port))
    }

    fn encode(&self, target: &Target) -> Result<Bytes> {
        let host = target.host.as_bytes();
        let host_len = u16::try_from(host.len())
            .map_err(|_| ProxyError::Hook(format!("host too long: {} bytes", host.len())))?;
        let mut buf = BytesMut::with_capacity(4 + host.len());
        buf.put_u16_le(host_len);
        buf.put_slice(host);
        buf.put_u16_le(target.port);
        Ok(buf.freeze())
    }
}

/// Follows server reconnect directives
pub struct ReconnectPlugin {
    handle: ProxyHandle,
    packet_id: u8,
    mode: ReconnectMode,
    codec: Arc<dyn DirectiveCodec>,
}

impl ReconnectPlugin {
    pub fn new(handle: ProxyHandle, packet_id: u8, mode: ReconnectMode) -> Self {
        Self::with_codec(handle, packet_id, mode, Arc::new(HostPortCodec))
    }

    pub fn with_codec(
        handle: ProxyHandle,
        packet_id: u8,
        mode: ReconnectMode,
        codec: Arc<dyn DirectiveCodec>,
    ) -> Self {
        Self {
            handle,
            packet_id,
            mode,
            codec,
        }
    }

    /// Apply the directive and return what the client should receive
    fn on_directive(
        handle: &ProxyHandle,
        codec: &dyn DirectiveCodec,
        mode: ReconnectMode,
        raw: Bytes,
        id: u8,
    ) -> Result<Bytes> {
        let packet = Packet::parse(raw)?;
        let target = codec.decode(packet.payload())?;
        log::info!(target = %target, "Reconnect directive received");

        match mode {
            ReconnectMode::Seamless => {
                handle.reconnect(target, mode)?;
                Ok(Bytes::new())
            }
            ReconnectMode::AwaitClient => {
                // Encode first so a bad local address leaves the session untouched
                let local = codec.encode(&handle.local_target())?;
                handle.reconnect(target, mode)?;
                Ok(Packet::from_parts(id, &local).into_bytes())
            }
        }
    }
}

impl Plugin for ReconnectPlugin {
    fn name(&self) -> &str {
        "reconnect"
    }

    fn hooks(&self) -> Vec<(HookKey, Hook)> {
        let handle = self.handle.clone();
        let codec = Arc::clone(&self.codec);
        let mode = self.mode;
        vec![(
            HookKey::Packet(self.packet_id),
            hook(move |raw, id| Self::on_directive(&handle, codec.as_ref(), mode, raw, id)),
        )]
    }
}
