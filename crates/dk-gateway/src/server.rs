//! The gateway aggregate: tunnel listener, backend registry and adapter
//! manager, constructed once and shared by handle.
//!
//! The `list_backends`/`scan`/`authorize`/`authorizations` methods are the
//! surface an outer admin API calls. Each waits at most
//! [`REPLY_TTL`](crate::replies::REPLY_TTL) and returns serde-serializable
//! results.

use crate::adapter::{self, AdapterHandle, AdapterSettings, Grant};
use crate::config::GatewayConfig;
use crate::handshake;
use crate::registry::{self, BackendInfo, RegistryHandle, TunnelTimers};
use dk_core::{DkError, DkResult, ScanReport};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct Gateway {
    config: GatewayConfig,
    listener: TcpListener,
    registry: RegistryHandle,
    adapters: AdapterHandle,
}

impl Gateway {
    /// Bind the tunnel port and start the registry and adapter manager.
    pub async fn bind(config: GatewayConfig) -> DkResult<Self> {
        if config.auths.is_empty() {
            return Err(DkError::Config("no backend auths configured".into()));
        }
        let listener = TcpListener::bind((config.bind, config.serv_port)).await?;
        let registry = registry::spawn(TunnelTimers::from(&config));
        let adapters = adapter::spawn(AdapterSettings::from(&config), registry.clone());
        info!(
            addr = %listener.local_addr()?,
            backends = config.auths.len(),
            max_serves = config.max_serves,
            "gateway listening"
        );
        Ok(Self {
            config,
            listener,
            registry,
            adapters,
        })
    }

    pub fn local_addr(&self) -> DkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept backend tunnels forever. Each connection is authenticated in its
    /// own task and registered on success.
    pub async fn run(&self) -> DkResult<()> {
        let auths: Arc<HashMap<String, String>> = Arc::new(self.config.auths.clone());
        let window = self.config.handshake;
        loop {
            let (mut stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let auths = auths.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                match handshake::authenticate(&mut stream, &auths, window).await {
                    Ok(name) => {
                        info!(backend = %name, peer = %peer, "backend connected");
                        registry.register(name, peer.to_string(), Box::new(stream));
                    }
                    Err(e) => {
                        info!(peer = %peer, error = %e, "backend refused");
                    }
                }
            });
        }
    }

    pub async fn list_backends(&self, filter: Option<&str>) -> DkResult<Vec<BackendInfo>> {
        self.registry.list(filter).await
    }

    pub async fn scan(&self, backend: &str, port: u16) -> DkResult<ScanReport> {
        if port == 0 {
            return Ok(ScanReport::failure("invalid port '0', 1~65535 expected"));
        }
        self.registry.scan(backend, port).await
    }

    /// Let `source` reach `host:port` behind `backend`; returns the adapter port.
    pub async fn authorize(
        &self,
        source: IpAddr,
        backend: &str,
        host: IpAddr,
        port: u16,
    ) -> DkResult<u16> {
        self.adapters
            .authorize(source, backend, SocketAddr::new(host, port))
            .await
    }

    pub async fn authorizations(&self, source: IpAddr) -> DkResult<Vec<Grant>> {
        self.adapters.authorizations(source).await
    }
}
