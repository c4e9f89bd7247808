//! tether: command-line client for a tether gateway.
//!
//! Lists registered backends, sends one-off messages to a backend, or runs a
//! demo backend that echoes messages and forwards tunneled HTTP calls.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

use commands::serve::ServeOptions;
use commands::Target;

/// tether: talk to backends through a relay gateway
#[derive(Parser)]
#[command(name = "tether", version, about = "tether client: reach NAT-bound backends through a relay gateway")]
struct Cli {
    /// Gateway client endpoint, e.g. ws://relay:7401
    #[arg(short, long, global = true)]
    gateway: Option<String>,

    /// Gateway secret
    #[arg(long, global = true, env = "TETHER_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// SOCKS5 proxy for the gateway connection
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List backends registered with the gateway
    Backends {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Send one message to a backend and print the reply
    Send {
        /// Backend id, as shown by `tether backends`
        backend_id: String,
        /// Message: JSON, or any other text sent as a string
        message: String,
        /// The backend's API key
        #[arg(short = 'k', long = "key", env = "TETHER_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Run a demo backend that echoes messages
    Serve {
        /// API key clients must present
        #[arg(short = 'k', long = "key", env = "TETHER_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Display name shown to clients
        #[arg(long)]
        name: Option<String>,
        /// Device id (defaults to ~/.tether/device_id)
        #[arg(long)]
        device_id: Option<String>,
        /// Base URL that tunneled HTTP calls are forwarded to
        #[arg(long)]
        upstream: Option<String>,
        /// Gateway backend endpoint, e.g. ws://relay:7400
        #[arg(long)]
        backend_gateway: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("tether=debug,tether_cli=debug,tether_client=debug,tether_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("tether=warn,tether_cli=warn,tether_client=warn")
            .with_target(false)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("tether: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?.default;

    let secret = cli.secret.or(cfg.secret);
    let proxy = cli.proxy.or(cfg.proxy);
    let client_url = cli.gateway.unwrap_or(cfg.gateway);

    match cli.command {
        Command::Backends { json } => {
            let target = Target::resolve(client_url, secret, proxy)?;
            commands::backends::run(&target, json).await
        }
        Command::Send {
            backend_id,
            message,
            api_key,
            wait,
        } => {
            let target = Target::resolve(client_url, secret, proxy)?;
            commands::send::run(
                &target,
                &backend_id,
                &api_key,
                &message,
                Duration::from_secs(wait),
            )
            .await
        }
        Command::Serve {
            api_key,
            name,
            device_id,
            upstream,
            backend_gateway,
        } => {
            let backend_url = backend_gateway.unwrap_or(cfg.backend_gateway);
            let target = Target::resolve(backend_url, secret, proxy)?;
            let opts = ServeOptions {
                api_key,
                name,
                device_id,
                upstream,
            };
            commands::serve::run(&target, opts).await
        }
    }
}
