//! Asura proxy binary

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};

use asura::config::{CliArgs, ProxyConfig};
use asura::core::ProxyHandle;
use asura::directory::{HttpDirectory, ServerDirectory, StaticDirectory};
use asura::logger::{self, log};
use asura::plugins::{PacketLogPlugin, ReconnectPlugin};
use asura::{server_runner, Proxy};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode);

    log::info!(
        listen = %cli.listen_host,
        port = cli.port,
        "Starting Asura"
    );

    let config = ProxyConfig::from_cli(&cli)?;

    // Initial upstream target
    let directory: Box<dyn ServerDirectory> = match cli.static_target() {
        Some(target) => Box::new(StaticDirectory::new(target)),
        None => Box::new(
            HttpDirectory::new(&cli.directory_url, &cli.region, cli.directory_timeout)?
                .with_port(cli.remote_port()),
        ),
    };
    let remote = directory
        .resolve()
        .await
        .context("Failed to resolve the initial game server")?;
    log::info!(remote = %remote, region = %cli.region, "Proxy target selected");

    // Build proxy with the configured plugins
    let mut builder = Proxy::builder().config(config.clone()).remote(remote);
    if let Some(packet_id) = cli.reconnect_packet_id {
        let mode = cli.reconnect_mode;
        builder = builder.plugin(move |handle| ReconnectPlugin::new(handle, packet_id, mode));
    }
    if cli.log_packets {
        let filter = cli.log_filter.clone();
        builder = builder.plugin(move |_handle| PacketLogPlugin::new(filter));
    }
    let proxy = builder.build()?;

    let listener = server_runner::bind_listener(&config).context("Failed to start listener")?;

    spawn_signal_handler(proxy.handle());

    server_runner::run_proxy(proxy, listener).await?;
    Ok(())
}

/// Shut the proxy down on SIGINT / SIGTERM
fn spawn_signal_handler(handle: ProxyHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    (Err(e), _) | (_, Err(e)) => {
                        log::error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        handle.shutdown();
    });
}
