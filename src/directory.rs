//! Server directory
//!
//! Supplies the initial upstream target before the proxy starts, either from
//! the command line or from the game's HTTP server list.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GAME_PORT;
use crate::core::Target;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Source of the initial upstream target
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn resolve(&self) -> Result<Target>;
}

/// Fixed target given on the command line
pub struct StaticDirectory {
    target: Target,
}

impl StaticDirectory {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn resolve(&self) -> Result<Target> {
        Ok(self.target.clone())
    }
}

/// One entry of the server list
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub region: String,
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<ServerInfo>,
}

/// Server list fetched over HTTP
pub struct HttpDirectory {
    client: reqwest::Client,
    url: String,
    region: String,
    port: u16,
}

impl HttpDirectory {
    /// Create a directory client for `url`, preferring `region`
    pub fn new(url: impl Into<String>, region: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            region: region.into(),
            port: GAME_PORT,
        })
    }

    /// Port to pair with the listed host (the list carries hosts only)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Fetch the full server list
    pub async fn fetch_servers(&self) -> Result<Vec<ServerInfo>> {
        log::debug!(url = %self.url, "Fetching server list");

        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProxyError::Directory(format!(
                "server list request failed: {}",
                status
            )));
        }

        let list: ServerList = response.json().await?;
        log::info!(servers = list.servers.len(), "Received server list");
        Ok(list.servers)
    }
}

#[async_trait]
impl ServerDirectory for HttpDirectory {
    async fn resolve(&self) -> Result<Target> {
        let servers = self.fetch_servers().await?;
        let server = select_server(&servers, &self.region)?;
        log::info!(
            host = %server.host,
            name = %server.server_name,
            region = %server.region,
            "Selected server"
        );
        Ok(Target::new(server.host.clone(), self.port))
    }
}

/// First server in `region`
pub fn select_server<'a>(servers: &'a [ServerInfo], region: &str) -> Result<&'a ServerInfo> {
    servers.iter().find(|s| s.region == region).ok_or_else(|| {
        let available: Vec<&str> = servers.iter().map(|s| s.region.as_str()).collect();
        ProxyError::Directory(format!(
            "no server in region {}; available: [{}]",
            region,
            available.join(", ")
        ))
    })
}
