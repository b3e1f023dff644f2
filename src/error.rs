use std::io;
use thiserror::Error;

use crate::core::Target;

/// Unified error type for the proxy core
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Peer closed or reset the connection, possibly mid-packet
    #[error("Connection closed")]
    ConnectionClosed,

    /// Header declared a length the codec refuses to assemble
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream connect failed
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: Target,
        #[source]
        source: io::Error,
    },

    /// Upstream connect did not finish in time
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(Target),

    /// Server directory could not supply a target
    #[error("Server directory error: {0}")]
    Directory(String),

    /// Hook faulted instead of returning bytes
    #[error("Hook failure: {0}")]
    Hook(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session has been shut down
    #[error("Proxy has been shut down")]
    Killed,
}

impl ProxyError {
    /// True for errors that mean the peer is gone rather than misbehaving
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProxyError::ConnectionClosed | ProxyError::Io(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Directory(err.to_string())
    }
}
