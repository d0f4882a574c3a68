//! Backend configuration: the `[backend]` section of the shared TOML file.

use dk_core::{in_range, validate_name, DkError, DkResult};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub backend: Option<BackendSection>,
}

/// `[backend]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub name: String,
    pub ctrl_host: String,
    #[serde(default = "default_ctrl_port")]
    pub ctrl_port: i64,
    pub auth: String,
    #[serde(default = "default_conn_wait")]
    pub conn_wait: i64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: i64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: i64,
}

fn default_ctrl_port() -> i64 {
    35350
}
fn default_conn_wait() -> i64 {
    10
}
fn default_dial_timeout() -> i64 {
    10
}
fn default_read_timeout() -> i64 {
    180
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub ctrl_host: String,
    pub ctrl_port: u16,
    /// Shared secret for the handshake proof.
    pub auth: String,
    /// Timeout for dialing the gateway and sending the proof.
    pub conn_wait: Duration,
    /// Timeout for dialing a session destination.
    pub dial_timeout: Duration,
    /// Tunnel receive deadline; must exceed the gateway keep-alive.
    pub read_timeout: Duration,
}

impl BackendConfig {
    pub fn from_toml(content: &str) -> DkResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| DkError::Config(format!("config parse error: {e}")))?;
        let section = file
            .backend
            .ok_or_else(|| DkError::Config("missing [backend] section".into()))?;
        Self::resolve(section)
    }

    pub fn resolve(section: BackendSection) -> DkResult<Self> {
        let name = validate_name(&section.name)?;
        let ctrl_host = section.ctrl_host.trim().to_string();
        if ctrl_host.is_empty() {
            return Err(DkError::Config("ctrl_host is required".into()));
        }
        if section.auth.is_empty() {
            return Err(DkError::Config("auth is required".into()));
        }
        let ctrl_port = in_range("ctrl_port", section.ctrl_port, 1, 65535, default_ctrl_port());
        let conn_wait = in_range("conn_wait", section.conn_wait, 1, 60, default_conn_wait());
        let dial_timeout = in_range("dial_timeout", section.dial_timeout, 1, 60, default_dial_timeout());
        let read_timeout = in_range("read_timeout", section.read_timeout, 10, 3600, default_read_timeout());

        Ok(Self {
            name,
            ctrl_host,
            ctrl_port: ctrl_port as u16,
            auth: section.auth,
            conn_wait: Duration::from_secs(conn_wait as u64),
            dial_timeout: Duration::from_secs(dial_timeout as u64),
            read_timeout: Duration::from_secs(read_timeout as u64),
        })
    }

    /// `host:port` of the gateway tunnel listener.
    pub fn ctrl_addr(&self) -> String {
        format!("{}:{}", self.ctrl_host, self.ctrl_port)
    }
}
