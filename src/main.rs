//! CONNECT proxy (v1)
//!
//! A forward proxy that only tunnels, built with Tokio.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                    CONNECT PROXY                     │
//!                 │                                                      │
//!   Client        │  ┌──────────┐   ┌────────────┐   ┌───────────────┐   │
//!   ──────────────┼─▶│   net    │──▶│ supervisor │──▶│ request parser│   │
//!                 │  │ listener │   │ (per conn) │   └───────┬───────┘   │
//!                 │  └──────────┘   └─────┬──────┘           ▼           │
//!                 │                       │          ┌───────────────┐   │   Destination
//!                 │                       │          │  establisher  │───┼──────────▶
//!                 │                       │          └───────┬───────┘   │
//!                 │                       ▼                  ▼           │
//!   ◀─────────────┼────────────── relay (client ⇄ destination) ◀─────────┼──────────▶
//!                 │                                                      │
//!                 │  config · observability · lifecycle (cross-cutting)  │
//!                 └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```text
//! $ connect-proxy --port 8080
//! $ curl -x http://127.0.0.1:8080 https://example.com
//! ```

use std::path::PathBuf;

use clap::Parser;

use connect_proxy::config::{self, ProxyConfig};
use connect_proxy::lifecycle::{signals, Shutdown};
use connect_proxy::net::Listener;
use connect_proxy::observability::{logging, metrics};
use connect_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "connect-proxy")]
#[command(about = "Forward proxy that tunnels HTTP CONNECT requests", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configured bind address port.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = cli.port {
        config.listener.set_port(port)?;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    config::validate_config(&config).map_err(config::ConfigError::Validation)?;

    logging::init_logging(&config.observability);

    tracing::info!("connect-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        max_request_bytes = config.tunnel.max_request_bytes,
        chunk_size = config.tunnel.chunk_size,
        allowed_ports = ?config.tunnel.allowed_ports,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let server = ProxyServer::new(&config);
    server.run(listener, shutdown.subscribe()).await;

    tracing::info!("Goodbye for now");
    Ok(())
}
