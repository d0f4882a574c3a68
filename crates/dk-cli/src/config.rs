//! Config file location and loading for `dk backend`.

use anyhow::{Context, Result};
use dk_backend::BackendConfig;
use dk_core::expand_tilde;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default config location, shared with `dk-gateway`.
pub const DEFAULT_PATH: &str = "~/.dk/config.toml";

/// Sample written by `dk init`.
pub const SAMPLE: &str = include_str!("sample.toml");

/// Expand a leading `~/` in a command-line path.
pub fn resolve_path(raw: &str) -> PathBuf {
    expand_tilde(Path::new(raw))
}

/// Read the `[backend]` section of the file at `path`.
pub fn load_backend(path: &Path) -> Result<BackendConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config = BackendConfig::from_toml(&content)
        .with_context(|| format!("invalid config at {}", path.display()))?;
    debug!(path = %path.display(), backend = %config.name, "loaded config");
    Ok(config)
}
