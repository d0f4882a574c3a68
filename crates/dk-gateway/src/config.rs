//! Gateway configuration: `[gateway]` section of a TOML file + CLI overrides.
//!
//! Numeric values outside their valid range fall back to the default instead
//! of failing the load.

use dk_core::{expand_tilde, in_range, validate_name, DkError, DkResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure. Other sections are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_serv_port")]
    pub serv_port: i64,
    #[serde(default = "default_max_serves")]
    pub max_serves: i64,
    #[serde(default = "default_handshake")]
    pub handshake: i64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: i64,
    #[serde(default = "default_idle_close")]
    pub idle_close: i64,
    #[serde(default = "default_auth_time")]
    pub auth_time: i64,
    /// Backend name to shared secret.
    #[serde(default)]
    pub auths: BTreeMap<String, String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            serv_port: default_serv_port(),
            max_serves: default_max_serves(),
            handshake: default_handshake(),
            keep_alive: default_keep_alive(),
            idle_close: default_idle_close(),
            auth_time: default_auth_time(),
            auths: BTreeMap::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_serv_port() -> i64 {
    35350
}
fn default_max_serves() -> i64 {
    9
}
fn default_handshake() -> i64 {
    10
}
fn default_keep_alive() -> i64 {
    60
}
fn default_idle_close() -> i64 {
    600
}
fn default_auth_time() -> i64 {
    3600
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    /// Tunnel port; adapters are allocated upward from `serv_port + 1`.
    pub serv_port: u16,
    pub max_serves: usize,
    pub handshake: Duration,
    /// `None` disables keep-alive pings.
    pub keep_alive: Option<Duration>,
    pub idle_close: Duration,
    /// Authorization lifetime, also the idle lifetime of an adapter.
    pub auth_time: Duration,
    pub auths: HashMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            serv_port: default_serv_port() as u16,
            max_serves: default_max_serves() as usize,
            handshake: secs(default_handshake()),
            keep_alive: Some(secs(default_keep_alive())),
            idle_close: secs(default_idle_close()),
            auth_time: secs(default_auth_time()),
            auths: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli_port: Option<u16>) -> DkResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::resolve(file_config.gateway)?;
        if let Some(port) = cli_port {
            config.serv_port = port;
        }
        Ok(config)
    }

    /// Validate a section, replacing out-of-range values with defaults.
    pub fn resolve(section: GatewaySection) -> DkResult<Self> {
        let bind = section.bind.parse::<IpAddr>().unwrap_or_else(|_| {
            warn!(bind = %section.bind, "invalid bind address, using 0.0.0.0");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let serv_port = in_range("serv_port", section.serv_port, 1, 65535, default_serv_port());
        let max_serves = in_range("max_serves", section.max_serves, 1, 99, default_max_serves());
        let handshake = in_range("handshake", section.handshake, 1, 60, default_handshake());
        let idle_close = in_range("idle_close", section.idle_close, 1, 3600, default_idle_close());
        let auth_time = in_range("auth_time", section.auth_time, 1, 86400, default_auth_time());
        let keep_alive = (section.keep_alive > 0).then(|| secs(section.keep_alive));

        let mut auths = HashMap::with_capacity(section.auths.len());
        for (name, secret) in section.auths {
            let name = validate_name(&name)?;
            if auths.insert(name.clone(), secret).is_some() {
                return Err(DkError::Config(format!("duplicate backend name '{name}'")));
            }
        }

        Ok(Self {
            bind,
            serv_port: serv_port as u16,
            max_serves: max_serves as usize,
            handshake: secs(handshake),
            keep_alive,
            idle_close: secs(idle_close),
            auth_time: secs(auth_time),
            auths,
        })
    }

    /// Receive deadline for tunnels: long enough to always see a ping.
    pub fn tunnel_read_timeout(&self) -> Duration {
        let floor = Duration::from_secs(60);
        match self.keep_alive {
            Some(ping) => (ping * 3).max(floor),
            None => self.idle_close.max(floor),
        }
    }

    /// Period of the per-backend idle session sweep: `idle_close / 2` clamped to 60..=600s.
    pub fn sweep_interval(&self) -> Duration {
        (self.idle_close / 2).clamp(Duration::from_secs(60), Duration::from_secs(600))
    }
}

fn parse(content: &str) -> DkResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| DkError::Config(format!("config parse error: {e}")))
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(value.unsigned_abs())
}
