//! Helpers shared by the gateway and backend config loaders.

use std::path::{Path, PathBuf};
use tracing::warn;

/// `value` when it lies in `min..=max`, otherwise `default` with a warning
/// naming `key`.
pub fn in_range(key: &str, value: i64, min: i64, max: i64, default: i64) -> i64 {
    if (min..=max).contains(&value) {
        value
    } else {
        warn!(key, value, default, "config value out of range, using default");
        default
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_keeps_bounds_and_replaces_outliers() {
        assert_eq!(in_range("port", 1, 1, 65535, 80), 1);
        assert_eq!(in_range("port", 65535, 1, 65535, 80), 65535);
        assert_eq!(in_range("port", 0, 1, 65535, 80), 80);
        assert_eq!(in_range("port", -3, 1, 65535, 80), 80);
        assert_eq!(in_range("port", 70000, 1, 65535, 80), 80);
    }

    #[test]
    fn tilde_expands_to_home() {
        let resolved = expand_tilde(Path::new("~/.dk/config.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join(".dk/config.toml"));
        }
        assert_eq!(
            expand_tilde(Path::new("/etc/dk.toml")),
            PathBuf::from("/etc/dk.toml")
        );
        assert_eq!(expand_tilde(Path::new("~other/x")), PathBuf::from("~other/x"));
    }
}
