//! Packet proxy for a length-prefixed game protocol
//!
//! Architecture:
//! - `core/`: Framing, hook dispatch, session lifecycle and forwarding
//! - `plugins/`: Built-in plugins (reconnect directives, packet logging)
//! - `directory`: Initial server lookup
//! - `server_runner`: Listener binding and the proxy loops

pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod logger;
pub mod plugins;
pub mod server_runner;

pub use crate::core::{Proxy, ProxyBuilder, ProxyHandle, ReconnectMode, Target};
pub use error::{ProxyError, Result};
