//! `dk backend`: run the agent until interrupted.

use crate::config;
use anyhow::Result;
use dk_backend::Agent;
use std::path::Path;
use tracing::info;

pub async fn run(path: &Path) -> Result<()> {
    let cfg = config::load_backend(path)?;
    info!(backend = %cfg.name, gateway = %cfg.ctrl_addr(), "starting backend agent");
    let agent = Agent::new(cfg);

    tokio::select! {
        result = agent.run() => result?,
        _ = crate::shutdown_signal() => info!("received shutdown signal"),
    }
    info!("backend agent stopped");
    Ok(())
}
