//! dk: DoorKeeper command line.
//!
//! Runs the backend agent that tunnels gateway sessions into the LAN, and
//! writes a starter config shared with `dk-gateway`.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// dk: DoorKeeper
#[derive(Parser)]
#[command(name = "dk", version, about = "DoorKeeper reverse-tunnel backend")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dial the gateway and relay its sessions
    Backend {
        /// Config file path
        #[arg(short, long, default_value = config::DEFAULT_PATH)]
        config: String,
    },

    /// Write a sample config file
    Init {
        /// Where to write it
        #[arg(default_value = config::DEFAULT_PATH)]
        path: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Backend { config } => commands::backend::run(&config::resolve_path(&config)).await,
        Command::Init { path } => commands::init::run(&config::resolve_path(&path)),
    };

    if let Err(e) = result {
        eprintln!("dk: {e:#}");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub(crate) async fn shutdown_signal() {
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
