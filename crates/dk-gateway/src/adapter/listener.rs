//! A single adapter: one ephemeral listening port gated by per-source
//! authorizations.
//!
//! The authorization map is shared between the manager loop (which grants)
//! and the adapter's own accept loop (which admits), so it sits behind a lock.
//! Neither side holds the lock across an await.
//!
//! An adapter retires exactly once, when its accept loop stops. Retiring and
//! granting take the same lock, so a grant either lands before the idle
//! check or is refused.

use crate::registry::{ConnectionRequest, RegistryHandle};
use dk_core::Socket;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Period at which an accept loop checks whether its adapter went idle.
const IDLE_CHECK: Duration = Duration::from_secs(1);

/// Time-limited grant letting `source` reach `host:port` behind `backend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub source: IpAddr,
    pub backend: String,
    pub host: IpAddr,
    pub port: u16,
    pub expiry: Instant,
}

impl Authorization {
    pub fn is_live(&self) -> bool {
        Instant::now() < self.expiry
    }

    pub fn dest(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn targets(&self, backend: &str, dest: SocketAddr) -> bool {
        self.backend == backend && self.dest() == dest
    }
}

/// A live authorization as reported to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    /// Adapter port the source should connect to.
    pub adapter: u16,
    pub backend: String,
    pub host: String,
    pub port: u16,
    /// Seconds until the grant lapses.
    pub expires_in: u64,
}

/// How an adapter relates to a new authorization request from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// No live authorization for this source; the adapter can be claimed.
    Free,
    /// This source is already authorized here for a different destination.
    Other,
    /// This source is already authorized here for exactly this destination.
    Exact,
}

struct Usage {
    last_used: Instant,
    retired: bool,
}

pub struct Adapter {
    pub port: u16,
    auths: RwLock<HashMap<IpAddr, Authorization>>,
    usage: Mutex<Usage>,
}

impl Adapter {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            auths: RwLock::new(HashMap::new()),
            usage: Mutex::new(Usage {
                last_used: Instant::now(),
                retired: false,
            }),
        }
    }

    fn usage(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn matches(&self, source: IpAddr, backend: &str, dest: SocketAddr) -> Match {
        let auths = self.auths.read().unwrap_or_else(PoisonError::into_inner);
        match auths.get(&source) {
            Some(auth) if auth.is_live() && auth.targets(backend, dest) => Match::Exact,
            Some(auth) if auth.is_live() => Match::Other,
            _ => Match::Free,
        }
    }

    /// Store `auth` for its source, replacing any previous one. Refused
    /// once the adapter has retired.
    pub fn grant(&self, auth: Authorization) -> bool {
        let mut usage = self.usage();
        if usage.retired {
            return false;
        }
        self.auths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(auth.source, auth);
        usage.last_used = Instant::now();
        true
    }

    /// The live authorization for `source`, if any.
    pub fn admit(&self, source: IpAddr) -> Option<Authorization> {
        let auths = self.auths.read().unwrap_or_else(PoisonError::into_inner);
        auths.get(&source).filter(|a| a.is_live()).cloned()
    }

    /// Drop expired authorizations; returns how many went.
    pub fn purge(&self) -> usize {
        let mut auths = self.auths.write().unwrap_or_else(PoisonError::into_inner);
        let before = auths.len();
        auths.retain(|_, a| a.is_live());
        before - auths.len()
    }

    pub fn grant_for(&self, source: IpAddr) -> Option<Grant> {
        self.admit(source).map(|a| Grant {
            adapter: self.port,
            backend: a.backend.clone(),
            host: a.host.to_string(),
            port: a.port,
            expires_in: a.expiry.saturating_duration_since(Instant::now()).as_secs(),
        })
    }

    pub fn touch(&self) {
        self.usage().last_used = Instant::now();
    }

    pub fn is_idle(&self, life: Duration) -> bool {
        self.usage().last_used.elapsed() >= life
    }

    pub fn is_retired(&self) -> bool {
        self.usage().retired
    }

    /// Retire the adapter if it has been idle for `life`. Returns whether it
    /// is now retired.
    pub fn retire_if_idle(&self, life: Duration) -> bool {
        let mut usage = self.usage();
        if !usage.retired && usage.last_used.elapsed() >= life {
            usage.retired = true;
        }
        usage.retired
    }

    pub fn retire(&self) {
        self.usage().retired = true;
    }
}

/// Where an adapter's clients come from.
pub(super) trait Acceptor: Send + 'static {
    type Stream: Socket;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accept clients until the adapter has seen no admitted connection for
/// `idle_life`, or until accepting fails. Admitted clients are handed to the
/// registry under a fresh random session id; everyone else is closed on the
/// spot. The adapter is retired when this returns.
pub(super) async fn accept_loop<A: Acceptor>(
    adapter: Arc<Adapter>,
    listener: A,
    idle_life: Duration,
    registry: RegistryHandle,
) {
    let port = adapter.port;
    let mut idle_check = tokio::time::interval(IDLE_CHECK);
    loop {
        tokio::select! {
            _ = idle_check.tick() => {
                if adapter.retire_if_idle(idle_life) {
                    info!(port, "adapter idle, closing");
                    break;
                }
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(port, error = %e, "accept failed, closing adapter");
                        adapter.retire();
                        break;
                    }
                };
                let source = peer.ip().to_canonical();
                let Some(auth) = adapter.admit(source) else {
                    info!(port, source = %source, "unauthorized client refused");
                    continue;
                };
                adapter.touch();
                let session: u32 = rand::random();
                debug!(
                    port,
                    source = %source,
                    backend = %auth.backend,
                    session = %format_args!("{session:08x}"),
                    "client admitted"
                );
                registry.connect(ConnectionRequest {
                    session,
                    backend: auth.backend.clone(),
                    dest: auth.dest(),
                    client: Box::new(stream),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TunnelTimers;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn auth(source: &str, ttl: Duration) -> Authorization {
        Authorization {
            source: source.parse().unwrap(),
            backend: "office".into(),
            host: "10.0.0.9".parse().unwrap(),
            port: 22,
            expiry: Instant::now() + ttl,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn match_classifies_sources() {
        let adapter = Adapter::new(35351);
        adapter.grant(auth("10.0.0.5", Duration::from_secs(60)));
        let dest: SocketAddr = "10.0.0.9:22".parse().unwrap();
        let src: IpAddr = "10.0.0.5".parse().unwrap();

        assert_eq!(adapter.matches(src, "office", dest), Match::Exact);
        assert_eq!(
            adapter.matches(src, "office", "10.0.0.9:80".parse().unwrap()),
            Match::Other
        );
        assert_eq!(adapter.matches(src, "lab", dest), Match::Other);
        assert_eq!(
            adapter.matches("10.0.0.6".parse().unwrap(), "office", dest),
            Match::Free
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_lapses_at_expiry() {
        let adapter = Adapter::new(35351);
        adapter.grant(auth("10.0.0.5", Duration::from_secs(60)));
        let src: IpAddr = "10.0.0.5".parse().unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let admitted = adapter.admit(src).unwrap();
        assert_eq!(admitted.dest(), "10.0.0.9:22".parse().unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(adapter.admit(src).is_none());
        assert_eq!(
            adapter.matches(src, "office", admitted.dest()),
            Match::Free
        );
        assert_eq!(adapter.purge(), 1);
        assert_eq!(adapter.purge(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newest_grant_overwrites() {
        let adapter = Adapter::new(35351);
        adapter.grant(auth("10.0.0.5", Duration::from_secs(60)));
        let mut newer = auth("10.0.0.5", Duration::from_secs(60));
        newer.port = 3389;
        adapter.grant(newer);
        let grant = adapter.grant_for("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(grant.port, 3389);
        assert_eq!(grant.adapter, 35351);
        assert_eq!(grant.expires_in, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_adapter_refuses_grants() {
        let adapter = Adapter::new(35351);
        let life = Duration::from_secs(30);
        assert!(!adapter.retire_if_idle(life));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(adapter.retire_if_idle(life));
        assert!(adapter.is_retired());
        assert!(!adapter.grant(auth("10.0.0.5", Duration::from_secs(60))));
        assert!(adapter.admit("10.0.0.5".parse().unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grant_before_idle_check_keeps_adapter() {
        let adapter = Adapter::new(35351);
        let life = Duration::from_secs(30);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(adapter.grant(auth("10.0.0.5", Duration::from_secs(60))));
        assert!(!adapter.retire_if_idle(life));
        assert!(!adapter.is_retired());
    }

    struct FailingAcceptor {
        calls: Arc<AtomicUsize>,
    }

    impl Acceptor for FailingAcceptor {
        type Stream = tokio::io::DuplexStream;

        fn accept(
            &self,
        ) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::other("too many open files")) }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_error_closes_adapter() {
        let adapter = Arc::new(Adapter::new(35351));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = crate::registry::spawn(TunnelTimers {
            read_timeout: Duration::from_secs(3600),
            keep_alive: None,
            idle_close: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
        });
        let listener = FailingAcceptor {
            calls: calls.clone(),
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            accept_loop(adapter.clone(), listener, Duration::from_secs(3600), registry),
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(adapter.is_retired());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_follows_last_use() {
        let adapter = Adapter::new(35351);
        let life = Duration::from_secs(30);
        assert!(!adapter.is_idle(life));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(adapter.is_idle(life));
        adapter.touch();
        assert!(!adapter.is_idle(life));
    }
}
