//! Adapter manager: allocation and reclamation of ephemeral client ports.
//!
//! One loop owns the adapter table. An authorization request is satisfied by,
//! in order:
//! 1. an adapter where this source already holds the same destination (reused as is)
//! 2. an adapter where this source holds nothing live (claimed)
//! 3. a new adapter on the first bindable port above the tunnel port
//!
//! and fails with [`DkError::Capacity`] once `max_serves` adapters exist.
//! Adapters close themselves when idle and tell the loop to forget them.
//! Retired adapters are never reused or counted, even before the loop hears
//! about them. That `Expired` notice waits for room in the queue, unlike
//! handle requests, so no closed adapter stays in the table.

mod listener;

pub use listener::{Adapter, Authorization, Grant, Match};

use crate::config::GatewayConfig;
use crate::registry::{wait_reply, RegistryHandle};
use dk_core::{DkError, DkResult};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 16;

/// Expired authorizations are purged at most this often.
const PURGE_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub bind: IpAddr,
    /// Adapters are allocated from `base_port + 1` upward.
    pub base_port: u16,
    pub max_serves: usize,
    /// Authorization lifetime and adapter idle lifetime.
    pub auth_time: Duration,
}

impl From<&GatewayConfig> for AdapterSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            bind: config.bind,
            base_port: config.serv_port,
            max_serves: config.max_serves,
            auth_time: config.auth_time,
        }
    }
}

enum AdapterCommand {
    Authorize {
        source: IpAddr,
        backend: String,
        dest: SocketAddr,
        reply: oneshot::Sender<DkResult<u16>>,
    },
    Query {
        source: IpAddr,
        reply: oneshot::Sender<Vec<Grant>>,
    },
    Expired {
        port: u16,
        id: u64,
    },
}

#[derive(Clone)]
pub struct AdapterHandle {
    tx: mpsc::Sender<AdapterCommand>,
    registry: RegistryHandle,
}

impl AdapterHandle {
    /// Authorize `source` to reach `dest` behind `backend`; returns the
    /// adapter port to connect to.
    ///
    /// The backend must be registered. That check runs here, on the caller's
    /// task, so the manager loop never waits on the registry.
    pub async fn authorize(
        &self,
        source: IpAddr,
        backend: &str,
        dest: SocketAddr,
    ) -> DkResult<u16> {
        let backend = backend.trim().to_ascii_lowercase();
        if self.registry.list(Some(&backend)).await?.is_empty() {
            return Err(DkError::NoSuchBackend(backend));
        }
        let dest = SocketAddr::new(dest.ip().to_canonical(), dest.port());
        let (reply, rx) = oneshot::channel();
        self.submit(AdapterCommand::Authorize {
            source: source.to_canonical(),
            backend,
            dest,
            reply,
        });
        wait_reply(rx).await?
    }

    /// Every live authorization held by `source`, across all adapters.
    pub async fn authorizations(&self, source: IpAddr) -> DkResult<Vec<Grant>> {
        let (reply, rx) = oneshot::channel();
        self.submit(AdapterCommand::Query {
            source: source.to_canonical(),
            reply,
        });
        wait_reply(rx).await
    }

    fn submit(&self, cmd: AdapterCommand) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("adapter queue full, request dropped"),
            Err(TrySendError::Closed(_)) => warn!("adapter manager stopped, request dropped"),
        }
    }
}

/// Start the manager loop.
pub fn spawn(settings: AdapterSettings, registry: RegistryHandle) -> AdapterHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let manager = Manager {
        settings,
        adapters: BTreeMap::new(),
        next_id: 0,
        last_purge: Instant::now(),
        registry: registry.clone(),
        notify: tx.downgrade(),
    };
    tokio::spawn(manager.run(rx));
    AdapterHandle { tx, registry }
}

struct AdapterEntry {
    adapter: Arc<Adapter>,
    id: u64,
    task: JoinHandle<()>,
}

struct Manager {
    settings: AdapterSettings,
    adapters: BTreeMap<u16, AdapterEntry>,
    next_id: u64,
    last_purge: Instant,
    registry: RegistryHandle,
    notify: mpsc::WeakSender<AdapterCommand>,
}

impl Manager {
    async fn run(mut self, mut rx: mpsc::Receiver<AdapterCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.purge();
            match cmd {
                AdapterCommand::Authorize {
                    source,
                    backend,
                    dest,
                    reply,
                } => {
                    let result = self.authorize(source, backend, dest).await;
                    let _ = reply.send(result);
                }
                AdapterCommand::Query { source, reply } => {
                    let grants = self
                        .adapters
                        .values()
                        .filter_map(|entry| entry.adapter.grant_for(source))
                        .collect();
                    let _ = reply.send(grants);
                }
                AdapterCommand::Expired { port, id } => {
                    if self.adapters.get(&port).is_some_and(|e| e.id == id) {
                        self.adapters.remove(&port);
                        debug!(port, "adapter forgotten");
                    }
                }
            }
        }
        for (_, entry) in std::mem::take(&mut self.adapters) {
            entry.task.abort();
        }
    }

    fn purge(&mut self) {
        if self.last_purge.elapsed() < PURGE_EVERY {
            return;
        }
        self.last_purge = Instant::now();
        let purged: usize = self.adapters.values().map(|e| e.adapter.purge()).sum();
        if purged > 0 {
            debug!(purged, "expired authorizations purged");
        }
    }

    async fn authorize(
        &mut self,
        source: IpAddr,
        backend: String,
        dest: SocketAddr,
    ) -> DkResult<u16> {
        let mut free = Vec::new();
        for (port, entry) in &self.adapters {
            if entry.adapter.is_retired() {
                continue;
            }
            match entry.adapter.matches(source, &backend, dest) {
                Match::Exact => return Ok(*port),
                Match::Free => free.push(entry.adapter.clone()),
                Match::Other => {}
            }
        }

        let auth = Authorization {
            source,
            backend,
            host: dest.ip(),
            port: dest.port(),
            expiry: Instant::now() + self.settings.auth_time,
        };

        for adapter in free {
            if adapter.grant(auth.clone()) {
                info!(port = adapter.port, source = %source, dest = %dest, "adapter claimed");
                return Ok(adapter.port);
            }
            debug!(port = adapter.port, "adapter retired while claiming");
        }

        let live = self
            .adapters
            .values()
            .filter(|e| !e.adapter.is_retired())
            .count();
        if live >= self.settings.max_serves {
            return Err(DkError::Capacity(live));
        }

        let (port, tcp) = self.bind_next().await?;
        let adapter = Arc::new(Adapter::new(port));
        adapter.grant(auth);
        self.next_id += 1;
        let id = self.next_id;
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let registry = self.registry.clone();
            let notify = self.notify.clone();
            let idle_life = self.settings.auth_time;
            async move {
                listener::accept_loop(adapter, tcp, idle_life, registry).await;
                if let Some(tx) = notify.upgrade() {
                    let _ = tx.send(AdapterCommand::Expired { port, id }).await;
                }
            }
        });
        self.adapters.insert(port, AdapterEntry { adapter, id, task });
        info!(port, source = %source, dest = %dest, "adapter created");
        Ok(port)
    }

    /// Bind the first free port above the base, skipping ports that fail.
    async fn bind_next(&self) -> DkResult<(u16, TcpListener)> {
        let start = u32::from(self.settings.base_port) + 1;
        for port in start..=u32::from(u16::MAX) {
            let port = port as u16;
            if self.adapters.contains_key(&port) {
                continue;
            }
            match TcpListener::bind(SocketAddr::new(self.settings.bind, port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => debug!(port, error = %e, "adapter port unavailable"),
            }
        }
        Err(DkError::Other("create adapter failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, TunnelTimers};
    use dk_core::frame::read_frame;
    use dk_core::ChunkType;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::TcpStream;

    fn timers() -> TunnelTimers {
        TunnelTimers {
            read_timeout: Duration::from_secs(3600),
            keep_alive: None,
            idle_close: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
        }
    }

    async fn free_base_port() -> u16 {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port().saturating_sub(100)
    }

    async fn setup(max_serves: usize, auth_time: Duration) -> (AdapterHandle, DuplexStream) {
        let registry = registry::spawn(timers());
        let (gateway, backend) = tokio::io::duplex(64 * 1024);
        registry.register("office".into(), "test".into(), Box::new(gateway));
        let settings = AdapterSettings {
            bind: "127.0.0.1".parse().unwrap(),
            base_port: free_base_port().await,
            max_serves,
            auth_time,
        };
        (spawn(settings, registry), backend)
    }

    async fn first_bindable_above(port: u16) -> u16 {
        for candidate in port + 1..=u16::MAX {
            if TcpListener::bind(("127.0.0.1", candidate)).await.is_ok() {
                return candidate;
            }
        }
        panic!("no bindable port above {port}");
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn same_request_reuses_adapter() {
        let (adapters, _backend) = setup(9, Duration::from_secs(3600)).await;
        let a = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:22"))
            .await
            .unwrap();
        let b = adapters
            .authorize(ip("10.0.0.5"), "Office", addr("10.0.0.9:22"))
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn new_destination_gets_new_adapter_and_free_ones_are_claimed() {
        let (adapters, _backend) = setup(9, Duration::from_secs(3600)).await;
        let ssh = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:22"))
            .await
            .unwrap();
        let rdp = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:3389"))
            .await
            .unwrap();
        assert_ne!(ssh, rdp);

        // another source claims the lowest adapter it has nothing on
        let other = adapters
            .authorize(ip("10.0.0.6"), "office", addr("10.0.0.7:80"))
            .await
            .unwrap();
        assert_eq!(other, ssh.min(rdp));

        let grants = adapters.authorizations(ip("10.0.0.5")).await.unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().any(|g| g.adapter == ssh && g.port == 22));
        assert!(grants.iter().any(|g| g.adapter == rdp && g.port == 3389));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (adapters, _backend) = setup(1, Duration::from_secs(3600)).await;
        let port = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:22"))
            .await
            .unwrap();
        // the port a new adapter would have been bound to
        let next = first_bindable_above(port).await;
        let res = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:80"))
            .await;
        assert!(matches!(res, Err(DkError::Capacity(1))));
        assert!(
            TcpListener::bind(("127.0.0.1", next)).await.is_ok(),
            "a listener was bound at capacity"
        );

        // the refused request left no adapter behind
        let grants = adapters.authorizations(ip("10.0.0.5")).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].adapter, port);
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let (adapters, _backend) = setup(9, Duration::from_secs(3600)).await;
        let res = adapters
            .authorize(ip("10.0.0.5"), "lab", addr("10.0.0.9:22"))
            .await;
        match res {
            Err(e @ DkError::NoSuchBackend(_)) => assert_eq!(e.to_string(), "no such backend: lab"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn authorized_client_reaches_backend() {
        let (adapters, mut backend) = setup(9, Duration::from_secs(3600)).await;
        let port = adapters
            .authorize(ip("127.0.0.1"), "office", addr("10.0.0.9:22"))
            .await
            .unwrap();

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let open = read_frame(&mut backend).await.unwrap();
        assert_eq!(open.chunk, ChunkType::Open);
        assert_eq!(open.open_target().unwrap().1, addr("10.0.0.9:22"));
    }

    #[tokio::test]
    async fn unauthorized_client_is_closed() {
        let (adapters, _backend) = setup(9, Duration::from_secs(3600)).await;
        let port = adapters
            .authorize(ip("10.0.0.5"), "office", addr("10.0.0.9:22"))
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
