//! backhaul-server: reverse-tunnel relay.
//!
//! Accepts public HTTP and WebSocket traffic for tenant projects and relays it
//! over a message bus to agents running inside the tenants' private networks.
//! Raw port-forward packets between agents are relayed the same way.

mod config;
mod consumer;
mod control;
mod directory;
mod relay;
mod server;
mod topology;
mod transport;

#[cfg(test)]
mod testing;

use backhaul_core::AmqpBus;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use control::ApiClient;
use server::BackhaulServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reverse-tunnel relay server
#[derive(Parser, Debug)]
#[command(name = "backhaul-server", version, about = "Reverse-tunnel relay server")]
struct Cli {
    /// Public HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Public WebSocket port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Suffix appended to default project domains (e.g. `.app.example.com`)
    #[arg(long)]
    platform_suffix: Option<String>,

    /// Seconds an HTTP request waits for its agent
    #[arg(long)]
    response_timeout: Option<u64>,

    /// Control-plane API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// AMQP broker URL
    #[arg(long)]
    bus_url: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.backhaul/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting backhaul-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        http_port: cli.http_port,
        websocket_port: cli.ws_port,
        platform_suffix: cli.platform_suffix,
        response_timeout_secs: cli.response_timeout,
        api_url: cli.api_url,
        bus_url: cli.bus_url,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let control = match ApiClient::new(server_config.control_plane.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to create control-plane client");
            std::process::exit(1);
        }
    };

    let bus = match AmqpBus::connect(&server_config.bus_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!(error = %e, "failed to connect to message broker");
            std::process::exit(1);
        }
    };
    let backhaul_server = BackhaulServer::new(server_config, bus, control);

    tokio::select! {
        result = backhaul_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("backhaul-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
