//! portfwd: multi-port TCP forwarding relay.
//!
//! Listens on every port of a configured range, admits clients by source
//! IP, and relays each connection to either a static upstream or a
//! randomly chosen candidate from a target file, pinned per client for a
//! configurable TTL.

mod config;
mod gateway;
mod server;
mod shutdown;

use clap::Parser;
use config::{CliOverrides, RelayConfig};
use server::RelayServer;
use shutdown::{stop_signal, StopTriggers};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// portfwd — TCP forwarding relay
#[derive(Parser, Debug)]
#[command(name = "portfwd", version, about = "Multi-port TCP forwarding relay")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    source_host: Option<String>,

    /// Ports to listen on, e.g. "8000-8002;9100"
    #[arg(short = 'p', long)]
    source_port: Option<String>,

    /// Static target host (requires --target-port)
    #[arg(long)]
    target_host: Option<String>,

    /// Static target port (requires --target-host)
    #[arg(long)]
    target_port: Option<u16>,

    /// File listing candidate targets, one host:port per line
    #[arg(short = 'f', long, conflicts_with_all = ["target_host", "target_port"])]
    target_file: Option<String>,

    /// Seconds a client stays pinned to a target drawn from the file
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Permitted client address (repeatable)
    #[arg(short = 'a', long = "allow")]
    allow: Vec<String>,

    /// Permit clients from any address
    #[arg(long, conflicts_with = "allow")]
    allow_any: bool,

    /// Relay chunk size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Stop when "quit" is typed on stdin
    #[arg(long)]
    console: bool,

    /// Config file path
    #[arg(long, default_value = "~/.portfwd/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            source_host: self.source_host.clone(),
            source_ports: self.source_port.clone(),
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            target_file: self.target_file.clone(),
            cache_ttl: self.cache_ttl,
            allow: self.allow.clone(),
            allow_any: self.allow_any,
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
        }
    }
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

    info!(version = env!("CARGO_PKG_VERSION"), "starting portfwd");

    let config_path = PathBuf::from(&cli.config);
    let relay_config = match RelayConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let triggers = StopTriggers {
        duration: cli.duration.map(Duration::from_secs),
        console: cli.console,
    };

    let relay = RelayServer::new(relay_config);
    if let Err(e) = relay.run_until(stop_signal(triggers)).await {
        error!(error = %e, "relay failed");
        std::process::exit(1);
    }

    info!("portfwd stopped");
}
