//! `dk init`: write a sample config file.

use crate::config::SAMPLE;
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

pub fn run(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, not overwriting", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(SAMPLE.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("wrote sample config to {}", path.display());
    println!("edit the [gateway.auths] secrets and [backend] ctrl_host before use");
    Ok(())
}
