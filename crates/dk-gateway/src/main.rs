//! dk-gateway: DoorKeeper gateway.
//!
//! Listens for backend tunnels on the service port and exposes authorized
//! destinations through adapter ports allocated above it.

use clap::Parser;
use dk_gateway::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// dk-gateway: DoorKeeper gateway
#[derive(Parser, Debug)]
#[command(name = "dk-gateway", version, about = "DoorKeeper gateway")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.dk/config.toml")]
    config: String,

    /// Tunnel listen port (overrides `serv_port`)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting dk-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(Some(&config_path), cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::bind(config).await {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("dk-gateway stopped");
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
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
