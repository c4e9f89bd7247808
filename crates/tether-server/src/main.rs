//! tether-gateway: relay gateway binary.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tether_server::{ConfigOverrides, GatewayConfig, GatewayServer};
use tracing::{error, info, warn};

/// tether-gateway: relays clients to NAT-bound backends
#[derive(Parser, Debug)]
#[command(name = "tether-gateway", version, about = "tether relay gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.tether/gateway.toml")]
    config: String,

    /// Address to bind all listeners on
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Port for backend connections
    #[arg(long)]
    backend_port: Option<u16>,

    /// Port for client connections
    #[arg(long)]
    client_port: Option<u16>,

    /// Port for the HTTP tunnel
    #[arg(long)]
    http_port: Option<u16>,

    /// Secret backends present when registering
    #[arg(long, env = "TETHER_GATEWAY_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Secret clients present (defaults to the gateway secret)
    #[arg(long, env = "TETHER_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// HTTP tunnel timeout in seconds
    #[arg(long)]
    http_timeout: Option<u64>,

    /// Seconds an offline backend stays listed before it is forgotten
    #[arg(long)]
    offline_grace: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tether-gateway");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        backend_port: cli.backend_port,
        client_port: cli.client_port,
        http_port: cli.http_port,
        gateway_secret: cli.secret,
        client_secret: cli.client_secret,
        http_timeout_secs: cli.http_timeout,
        offline_grace_secs: cli.offline_grace,
    };
    let config = match GatewayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let mut running = match GatewayServer::new(config).bind().await {
        Ok(running) => running,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = running.wait() => {
            warn!("listeners stopped");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    running.shutdown();
    info!("tether-gateway stopped");
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
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
