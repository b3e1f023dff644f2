//! Configuration module
//!
//! CLI argument parsing with environment variable support, and the runtime
//! settings derived from it.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::core::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::core::peer::PeerConfig;
use crate::core::{ReconnectMode, Target};

/// Well-known game port, used on both ends unless overridden
pub const GAME_PORT: u16 = 6410;

/// Default server list endpoint
pub const DEFAULT_DIRECTORY_URL: &str = "https://playdarzas.com/api/v1/serverlist";

/// Parse duration string (e.g., "10s", "2m") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '10s', '2m' or plain seconds",
            s
        )
    })
}

fn parse_reconnect_mode(s: &str) -> Result<ReconnectMode, String> {
    match s.to_lowercase().as_str() {
        "seamless" => Ok(ReconnectMode::Seamless),
        "await_client" | "await-client" => Ok(ReconnectMode::AwaitClient),
        _ => Err(format!(
            "Invalid reconnect mode '{}'. Use 'seamless' or 'await_client'",
            s
        )),
    }
}

/// CLI arguments
///
/// Supports environment variables with the ASURA_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Packet proxy with plugin hooks for the game protocol")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Address the proxy listens on for the game client
    #[arg(long, env = "ASURA_LISTEN_HOST", default_value = "127.0.0.1")]
    pub listen_host: String,

    /// Local port (the game port by default)
    #[arg(long, env = "ASURA_PORT", default_value_t = GAME_PORT)]
    pub port: u16,

    /// Game server host; skips the server directory when set
    #[arg(long, env = "ASURA_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// Game server port (defaults to --port)
    #[arg(long, env = "ASURA_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Server list endpoint
    #[arg(long, env = "ASURA_DIRECTORY_URL", default_value = DEFAULT_DIRECTORY_URL)]
    pub directory_url: String,

    /// Preferred server region from the server list
    #[arg(long, env = "ASURA_REGION", default_value = "USEast")]
    pub region: String,

    /// Server list request timeout (default: 10s)
    #[arg(long, env = "ASURA_DIRECTORY_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub directory_timeout: Duration,

    /// Packet id of the server's reconnect directive; enables reconnect handling
    #[arg(long, env = "ASURA_RECONNECT_PACKET_ID")]
    pub reconnect_packet_id: Option<u8>,

    /// How to re-establish the upstream after a reconnect directive
    #[arg(long, env = "ASURA_RECONNECT_MODE", default_value = "await_client", value_parser = parse_reconnect_mode)]
    pub reconnect_mode: ReconnectMode,

    /// Log id and size of every packet at debug level
    #[arg(long, env = "ASURA_LOG_PACKETS", default_value_t = false)]
    pub log_packets: bool,

    /// Packet ids excluded from packet logging (comma separated)
    #[arg(long, env = "ASURA_LOG_FILTER", value_delimiter = ',')]
    pub log_filter: Vec<u8>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "ASURA_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// TCP connect timeout to the game server (default: 10s)
    #[arg(long, env = "ASURA_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Largest accepted packet length field in bytes (default: 8MB)
    #[arg(long, env = "ASURA_MAX_PACKET_SIZE", default_value_t = DEFAULT_MAX_PACKET_SIZE, help_heading = "Performance")]
    pub max_packet_size: usize,

    /// Packets queued per peer before forwarding waits (default: 1024)
    #[arg(long, env = "ASURA_OUTBOUND_QUEUE", default_value_t = 1024, help_heading = "Performance")]
    pub outbound_queue: usize,

    /// TCP listen backlog (default: 128)
    #[arg(long, env = "ASURA_TCP_BACKLOG", default_value_t = 128, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY on both sockets (default: true)
    #[arg(long, env = "ASURA_TCP_NODELAY", default_value_t = true, help_heading = "Performance")]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(anyhow!("listen host is required"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be greater than 0"));
        }
        if let Some(ref host) = self.remote_host {
            if host.is_empty() {
                return Err(anyhow!("remote host must not be empty"));
            }
        }
        if self.remote_port == Some(0) {
            return Err(anyhow!("remote port must be greater than 0"));
        }
        if self.remote_host.is_none() && self.directory_url.is_empty() {
            return Err(anyhow!(
                "either --remote_host or --directory_url is required"
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }
        if self.directory_timeout.is_zero() {
            return Err(anyhow!("directory_timeout must be greater than 0"));
        }
        if self.max_packet_size == 0 {
            return Err(anyhow!("max_packet_size must be greater than 0"));
        }
        if self.outbound_queue == 0 {
            return Err(anyhow!("outbound_queue must be greater than 0"));
        }
        Ok(())
    }

    /// Upstream port, falling back to the local port
    pub fn remote_port(&self) -> u16 {
        self.remote_port.unwrap_or(self.port)
    }

    /// Fixed upstream target when given on the command line
    pub fn static_target(&self) -> Option<Target> {
        self.remote_host
            .as_ref()
            .map(|host| Target::new(host.clone(), self.remote_port()))
    }
}

/// Runtime proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds
    pub listen_addr: SocketAddr,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Largest accepted packet length field
    pub max_packet_size: usize,
    /// Per-peer outbound queue depth
    pub outbound_queue: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl ProxyConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let ip: IpAddr = cli
            .listen_host
            .parse()
            .map_err(|e| anyhow!("invalid listen host {}: {}", cli.listen_host, e))?;
        Ok(Self {
            listen_addr: SocketAddr::new(ip, cli.port),
            connect_timeout: cli.connect_timeout,
            max_packet_size: cli.max_packet_size,
            outbound_queue: cli.outbound_queue,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        })
    }

    /// Loopback listener on `port`, defaults everywhere else
    pub fn local(port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            connect_timeout: Duration::from_secs(10),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_queue: 1024,
            tcp_backlog: 128,
            tcp_nodelay: true,
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            max_packet_size: self.max_packet_size,
            outbound_queue: self.outbound_queue,
        }
    }
}
