//! Backend registry: live backend tunnels indexed by name.
//!
//! A single command loop owns the table and is the only task that adds or
//! removes backends. Everything else talks to it through a [`RegistryHandle`]
//! over a bounded queue; handle calls never block, a full queue drops the
//! newest command. The one exception is `Unregister`, sent by a backend's own
//! exiting tasks, which waits for room so a dead tunnel is always removed.
//!
//! At most one tunnel is live per name: registering a name that is already
//! present shuts the old tunnel and all of its sessions down first.

mod backend;

use crate::config::GatewayConfig;
use crate::replies::{ReplyTable, REPLY_TTL};
use backend::{BackendEntry, BackendEvent, Shared};
use dk_core::{BoxSocket, DkError, DkResult, ScanReport, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the registry command queue.
pub const COMMAND_QUEUE: usize = 64;

/// Timers applied to every tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelTimers {
    pub read_timeout: Duration,
    pub keep_alive: Option<Duration>,
    pub idle_close: Duration,
    pub sweep_interval: Duration,
}

impl From<&GatewayConfig> for TunnelTimers {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            read_timeout: config.tunnel_read_timeout(),
            keep_alive: config.keep_alive,
            idle_close: config.idle_close,
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// An accepted client socket to be bridged to `dest` behind `backend`.
pub struct ConnectionRequest {
    pub session: SessionId,
    pub backend: String,
    pub dest: SocketAddr,
    pub client: BoxSocket,
}

/// A registered backend, as reported to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub peer: String,
    /// Seconds since the tunnel was registered.
    pub uptime: u64,
}

pub(crate) enum RegistryCommand {
    Register {
        name: String,
        peer: String,
        socket: BoxSocket,
    },
    Connect(ConnectionRequest),
    List {
        filter: Option<String>,
        reply: oneshot::Sender<Vec<BackendInfo>>,
    },
    Scan {
        name: String,
        port: u16,
        reply: oneshot::Sender<ScanReport>,
    },
    Unregister {
        name: String,
        instance: u64,
    },
}

/// Cheap, cloneable handle to the registry loop.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Install an authenticated tunnel under `name`.
    pub fn register(&self, name: String, peer: String, socket: BoxSocket) {
        self.submit(RegistryCommand::Register { name, peer, socket });
    }

    /// Bridge a client to a backend. Fire-and-forget: if the backend is
    /// unknown the client socket is simply closed.
    pub fn connect(&self, req: ConnectionRequest) {
        self.submit(RegistryCommand::Connect(req));
    }

    /// Registered backends, optionally only the one named `filter`.
    pub async fn list(&self, filter: Option<&str>) -> DkResult<Vec<BackendInfo>> {
        let (reply, rx) = oneshot::channel();
        let filter = filter.map(|f| f.trim().to_ascii_lowercase());
        self.submit(RegistryCommand::List { filter, reply });
        wait_reply(rx).await
    }

    /// Ask a backend which LAN hosts have `port` open.
    pub async fn scan(&self, name: &str, port: u16) -> DkResult<ScanReport> {
        let (reply, rx) = oneshot::channel();
        let name = name.trim().to_ascii_lowercase();
        self.submit(RegistryCommand::Scan { name, port, reply });
        wait_reply(rx).await
    }

    fn submit(&self, cmd: RegistryCommand) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("registry queue full, command dropped"),
            Err(TrySendError::Closed(_)) => warn!("registry stopped, command dropped"),
        }
    }
}

/// Wait up to [`REPLY_TTL`] for a loop to answer. A dropped sender counts as
/// no answer.
pub(crate) async fn wait_reply<T>(rx: oneshot::Receiver<T>) -> DkResult<T> {
    match tokio::time::timeout(REPLY_TTL, rx).await {
        Ok(Ok(value)) => Ok(value),
        _ => Err(DkError::Timeout),
    }
}

/// Start the registry loop.
pub fn spawn(timers: TunnelTimers) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let registry = Registry {
        backends: HashMap::new(),
        next_instance: 0,
        shared: Shared {
            timers,
            replies: Arc::new(ReplyTable::new()),
            registry: tx.downgrade(),
        },
    };
    tokio::spawn(registry.run(rx));
    RegistryHandle { tx }
}

struct Registry {
    backends: HashMap<String, BackendEntry>,
    next_instance: u64,
    shared: Shared,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
        for (_, entry) in self.backends.drain() {
            entry.shutdown().await;
        }
        debug!("backend registry stopped");
    }

    async fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { name, peer, socket } => {
                if let Some(old) = self.backends.remove(&name) {
                    info!(backend = %name, old_peer = %old.peer, "replacing existing tunnel");
                    old.shutdown().await;
                }
                self.next_instance += 1;
                let entry = backend::start(
                    name.clone(),
                    self.next_instance,
                    peer.clone(),
                    socket,
                    &self.shared,
                );
                self.backends.insert(name.clone(), entry);
                info!(backend = %name, peer = %peer, "backend registered");
            }
            RegistryCommand::Connect(req) => match self.backends.get(&req.backend) {
                Some(entry) => {
                    entry.submit(BackendEvent::Bridge(req));
                }
                None => {
                    info!(backend = %req.backend, "connection for unknown backend closed");
                }
            },
            RegistryCommand::List { filter, reply } => {
                let mut list: Vec<BackendInfo> = self
                    .backends
                    .iter()
                    .filter(|(name, _)| filter.as_deref().map_or(true, |f| f == name.as_str()))
                    .map(|(name, entry)| BackendInfo {
                        name: name.clone(),
                        peer: entry.peer.clone(),
                        uptime: entry.since.elapsed().as_secs(),
                    })
                    .collect();
                list.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(list);
            }
            RegistryCommand::Scan { name, port, reply } => match self.backends.get(&name) {
                Some(entry) => {
                    entry.submit(BackendEvent::Scan { port, reply });
                }
                None => {
                    let _ = reply.send(ScanReport::failure(
                        DkError::NoSuchBackend(name).to_string(),
                    ));
                }
            },
            RegistryCommand::Unregister { name, instance } => {
                let current = self
                    .backends
                    .get(&name)
                    .is_some_and(|entry| entry.instance == instance);
                if current {
                    if let Some(entry) = self.backends.remove(&name) {
                        entry.shutdown().await;
                        info!(backend = %name, "backend unregistered");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dk_core::frame::read_frame;
    use dk_core::{ChunkType, Command, Frame, Origin};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

    fn timers() -> TunnelTimers {
        TunnelTimers {
            read_timeout: Duration::from_secs(3600),
            keep_alive: None,
            idle_close: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
        }
    }

    fn attach(handle: &RegistryHandle, name: &str) -> DuplexStream {
        let (gateway, backend) = tokio::io::duplex(64 * 1024);
        handle.register(name.to_string(), "test".to_string(), Box::new(gateway));
        backend
    }

    fn bridge(handle: &RegistryHandle, name: &str, session: SessionId) -> DuplexStream {
        bridge_with_buffer(handle, name, session, 64 * 1024)
    }

    fn bridge_with_buffer(
        handle: &RegistryHandle,
        name: &str,
        session: SessionId,
        buffer: usize,
    ) -> DuplexStream {
        let (gateway, client) = tokio::io::duplex(buffer);
        handle.connect(ConnectionRequest {
            session,
            backend: name.to_string(),
            dest: "10.0.0.9:22".parse().unwrap(),
            client: Box::new(gateway),
        });
        client
    }

    async fn write(stream: &mut DuplexStream, frame: Frame) {
        stream.write_all(&frame.encode().unwrap()).await.unwrap();
    }

    async fn wait_unregistered(handle: &RegistryHandle) -> bool {
        for _ in 0..50 {
            if handle.list(None).await.unwrap().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Tunnel whose writes start failing once `broken` is set while reads
    /// keep waiting on the peer.
    struct BrokenWrites {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl BrokenWrites {
        fn check(&self) -> io::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "write half gone"))
            } else {
                Ok(())
            }
        }
    }

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if let Err(e) = self.check() {
                return Poll::Ready(Err(e));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if let Err(e) = self.check() {
                return Poll::Ready(Err(e));
            }
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn bridges_client_over_tunnel() {
        let handle = spawn(timers());
        let mut backend = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 7);

        let open = read_frame(&mut backend).await.unwrap();
        assert_eq!(open.chunk, ChunkType::Open);
        assert_eq!(
            open.open_target().unwrap(),
            (7, "10.0.0.9:22".parse().unwrap())
        );

        write(&mut backend, Frame::data(7, b"SSH-2.0\r\n")).await;
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0\r\n");

        client.write_all(b"hello").await.unwrap();
        let data = read_frame(&mut backend).await.unwrap();
        assert_eq!(data.chunk, ChunkType::Data);
        assert_eq!(data.session_id().unwrap(), 7);
        assert_eq!(data.body(), b"hello");

        write(&mut backend, Frame::close(7)).await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn data_after_close_is_dropped() {
        let handle = spawn(timers());
        let mut backend = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 1);
        read_frame(&mut backend).await.unwrap();

        write(&mut backend, Frame::close(1)).await;
        write(&mut backend, Frame::data(1, b"late")).await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // tunnel is still healthy
        assert_eq!(handle.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn client_eof_sends_close() {
        let handle = spawn(timers());
        let mut backend = attach(&handle, "office");
        let client = bridge(&handle, "office", 3);
        read_frame(&mut backend).await.unwrap();

        drop(client);
        let close = read_frame(&mut backend).await.unwrap();
        assert_eq!(close.chunk, ChunkType::Close);
        assert_eq!(close.session_id().unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_backend_closes_client() {
        let handle = spawn(timers());
        let mut client = bridge(&handle, "nobody", 1);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn reregister_replaces_old_tunnel() {
        let handle = spawn(timers());
        let mut first = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 9);
        read_frame(&mut first).await.unwrap();

        let _second = attach(&handle, "office");
        let list = handle.list(None).await.unwrap();
        assert_eq!(list.len(), 1);

        // old tunnel and its session are both closed
        assert!(matches!(read_frame(&mut first).await, Err(DkError::Closed)));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let handle = spawn(timers());
        let _b = attach(&handle, "zeta");
        let _a = attach(&handle, "alpha");

        let names: Vec<String> = handle
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(handle.list(Some("ZETA")).await.unwrap().len(), 1);
        assert!(handle.list(Some("beta")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_reply_is_correlated() {
        let handle = spawn(timers());
        let mut backend = attach(&handle, "office");

        let responder = tokio::spawn(async move {
            let frame = read_frame(&mut backend).await.unwrap();
            let Command::ScanRequest { id, port } =
                Command::decode(&frame.payload, Origin::Gateway).unwrap()
            else {
                panic!("expected scan request");
            };
            assert_eq!(port, 22);
            let reply = Command::ScanReply {
                id,
                report: ScanReport::hosts(vec!["10.0.0.9".into()], port),
            };
            write(&mut backend, reply.into_frame().unwrap()).await;
            backend
        });

        let report = handle.scan("office", 22).await.unwrap();
        assert!(report.stat);
        assert_eq!(report.data, Some(vec!["10.0.0.9".to_string()]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn scan_unknown_backend_reports_failure() {
        let handle = spawn(timers());
        let report = handle.scan("nobody", 22).await.unwrap();
        assert!(!report.stat);
        assert_eq!(report.mesg.as_deref(), Some("no such backend: nobody"));
    }

    #[tokio::test]
    async fn tunnel_failure_unregisters_and_closes_sessions() {
        let mut t = timers();
        t.keep_alive = Some(Duration::from_millis(50));
        let handle = spawn(t);
        let mut backend = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 5);
        read_frame(&mut backend).await.unwrap();

        drop(backend);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(wait_unregistered(&handle).await);
    }

    #[tokio::test]
    async fn keepalive_write_failure_unregisters_and_closes_sessions() {
        let mut t = timers();
        t.keep_alive = Some(Duration::from_millis(50));
        let handle = spawn(t);
        let (gateway, mut backend) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        handle.register(
            "office".to_string(),
            "test".to_string(),
            Box::new(BrokenWrites {
                inner: gateway,
                broken: broken.clone(),
            }),
        );
        let mut client = bridge(&handle, "office", 5);
        loop {
            if read_frame(&mut backend).await.unwrap().chunk == ChunkType::Open {
                break;
            }
        }

        // the peer stays connected and silent, so only the next ping can fail
        broken.store(true, Ordering::SeqCst);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        assert!(wait_unregistered(&handle).await);
        drop(backend);
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_siblings() {
        let handle = spawn(timers());
        let mut backend = attach(&handle, "office");
        // never read, and the 16-byte pipe fills on the first write
        let _stalled = bridge_with_buffer(&handle, "office", 1, 16);
        read_frame(&mut backend).await.unwrap();
        let mut sibling = bridge(&handle, "office", 2);
        read_frame(&mut backend).await.unwrap();

        write(&mut backend, Frame::data(1, &[7u8; 4096])).await;
        write(&mut backend, Frame::data(2, b"hi")).await;

        let mut buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(3), sibling.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(handle.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn download_only_session_outlives_idle_close() {
        let mut t = timers();
        t.idle_close = Duration::from_secs(2);
        t.sweep_interval = Duration::from_secs(1);
        let handle = spawn(t);
        let mut backend = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 4);
        read_frame(&mut backend).await.unwrap();

        // the client never writes; only the backend keeps the session busy
        for i in 0..10u8 {
            write(&mut backend, Frame::data(4, &[i; 32])).await;
            let mut chunk = [0u8; 32];
            client.read_exact(&mut chunk).await.unwrap();
            assert_eq!(chunk, [i; 32]);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let pending = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut backend)).await;
        assert!(pending.is_err(), "session was closed while streaming");
    }

    #[tokio::test]
    async fn keepalive_pings_backend() {
        let mut t = timers();
        t.keep_alive = Some(Duration::from_millis(20));
        let handle = spawn(t);
        let mut backend = attach(&handle, "office");
        let ping = read_frame(&mut backend).await.unwrap();
        assert_eq!(ping, Command::ping());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let mut t = timers();
        t.idle_close = Duration::from_secs(1);
        t.sweep_interval = Duration::from_secs(1);
        let handle = spawn(t);
        let mut backend = attach(&handle, "office");
        let mut client = bridge(&handle, "office", 11);
        read_frame(&mut backend).await.unwrap();

        let close = read_frame(&mut backend).await.unwrap();
        assert_eq!(close.chunk, ChunkType::Close);
        assert_eq!(close.session_id().unwrap(), 11);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
