//! One live backend tunnel and the client sessions multiplexed over it.
//!
//! Three tasks per backend:
//! - the receive loop decodes tunnel frames into the dispatch queue
//! - the optional keep-alive ticker pings the backend
//! - the dispatcher owns the session table and is its only mutator
//!
//! The dispatcher never writes to a client socket itself. Each session has
//! its own [`SessionWriter`], so a client that stops reading cannot hold up
//! its siblings.
//!
//! Any fatal tunnel error ends in an `Unregister` sent to the registry, which
//! stops all three.

use super::{ConnectionRequest, RegistryCommand, TunnelTimers};
use crate::replies::ReplyTable;
use dk_core::conn::{self, BoxReader, BoxSocket, Conn, SessionWriter};
use dk_core::frame::{recv_frame, MAX_DATA};
use dk_core::{ChunkType, Command, DkError, DkResult, Frame, Origin, ScanReport, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of each backend's dispatch queue.
pub const DISPATCH_QUEUE: usize = 1024;

/// How long a replaced or failed backend gets to close its sessions before
/// its dispatcher is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Items consumed by a backend's dispatcher. Only `Frame` carries wire data;
/// the rest are in-process signals and never reach the codec.
pub(super) enum BackendEvent {
    Frame(Frame),
    Bridge(ConnectionRequest),
    Scan {
        port: u16,
        reply: oneshot::Sender<ScanReport>,
    },
    PumpClosed {
        session: SessionId,
        generation: u64,
    },
    WriteFailed {
        session: SessionId,
        generation: u64,
    },
}

/// The registry's view of a running backend.
pub(super) struct BackendEntry {
    pub instance: u64,
    pub peer: String,
    pub since: std::time::Instant,
    events: mpsc::Sender<BackendEvent>,
    stop: oneshot::Sender<()>,
    dispatch: JoinHandle<()>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl BackendEntry {
    /// Queue an event without waiting. A full queue drops it.
    pub fn submit(&self, event: BackendEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(instance = self.instance, "dispatch queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop every task and wait for the dispatcher to close the tunnel and
    /// all of its sessions.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        self.reader.abort();
        if let Some(keepalive) = self.keepalive {
            keepalive.abort();
        }
        let abort = self.dispatch.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.dispatch).await.is_err() {
            warn!(instance = self.instance, "dispatcher did not stop in time, aborting");
            abort.abort();
        }
    }
}

pub(super) struct Shared {
    pub timers: TunnelTimers,
    pub replies: Arc<ReplyTable<ScanReport>>,
    pub registry: mpsc::WeakSender<RegistryCommand>,
}

/// Start the tasks for a freshly authenticated tunnel.
pub(super) fn start(
    name: String,
    instance: u64,
    peer: String,
    socket: BoxSocket,
    shared: &Shared,
) -> BackendEntry {
    let (reader, writer) = conn::split(socket);
    let tunnel = Arc::new(Conn::new(writer));
    let (events_tx, events_rx) = mpsc::channel(DISPATCH_QUEUE);
    let (stop_tx, stop_rx) = oneshot::channel();
    let timers = shared.timers;

    let reader = tokio::spawn(receive_loop(
        name.clone(),
        instance,
        reader,
        timers.read_timeout,
        events_tx.clone(),
        shared.registry.clone(),
    ));

    let keepalive = timers.keep_alive.map(|every| {
        tokio::spawn(keepalive_loop(
            name.clone(),
            instance,
            tunnel.clone(),
            every,
            shared.registry.clone(),
        ))
    });

    let dispatcher = Dispatcher {
        name,
        instance,
        tunnel,
        sessions: HashMap::new(),
        next_generation: 0,
        idle_close: timers.idle_close,
        events: events_tx.downgrade(),
        replies: shared.replies.clone(),
        registry: shared.registry.clone(),
    };
    let dispatch = tokio::spawn(dispatcher.run(events_rx, stop_rx, timers.sweep_interval));

    BackendEntry {
        instance,
        peer,
        since: std::time::Instant::now(),
        events: events_tx,
        stop: stop_tx,
        dispatch,
        reader,
        keepalive,
    }
}

/// Waits for room in the registry queue: a lost `Unregister` would leave a
/// dead tunnel registered. Only the backend's own exiting tasks call this.
async fn unregister(registry: &mpsc::WeakSender<RegistryCommand>, name: String, instance: u64) {
    if let Some(tx) = registry.upgrade() {
        let _ = tx.send(RegistryCommand::Unregister { name, instance }).await;
    }
}

async fn receive_loop(
    name: String,
    instance: u64,
    mut reader: BoxReader,
    wait: Duration,
    events: mpsc::Sender<BackendEvent>,
    registry: mpsc::WeakSender<RegistryCommand>,
) {
    loop {
        match recv_frame(&mut reader, wait).await {
            Ok(frame) => match events.try_send(BackendEvent::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(backend = %name, "dispatch queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Err(DkError::Closed) => {
                info!(backend = %name, "tunnel closed by backend");
                break;
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "tunnel receive failed");
                break;
            }
        }
    }
    unregister(&registry, name, instance).await;
}

async fn keepalive_loop(
    name: String,
    instance: u64,
    tunnel: Arc<Conn>,
    every: Duration,
    registry: mpsc::WeakSender<RegistryCommand>,
) {
    let ping = Command::ping();
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = tunnel.send_frame(&ping).await {
            warn!(backend = %name, error = %e, "keep-alive failed");
            break;
        }
        debug!(backend = %name, "ping sent");
    }
    unregister(&registry, name, instance).await;
}

struct GatewaySession {
    conn: Arc<Conn>,
    writer: SessionWriter,
    pump: JoinHandle<()>,
    generation: u64,
}

impl GatewaySession {
    /// Stop both session tasks and shut the client socket.
    async fn close(self) {
        self.pump.abort();
        self.writer.stop();
        self.conn.close().await;
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct Dispatcher {
    name: String,
    instance: u64,
    tunnel: Arc<Conn>,
    sessions: HashMap<SessionId, GatewaySession>,
    /// Distinguishes a reused session id from the session it replaced.
    next_generation: u64,
    idle_close: Duration,
    events: mpsc::WeakSender<BackendEvent>,
    replies: Arc<ReplyTable<ScanReport>>,
    registry: mpsc::WeakSender<RegistryCommand>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<BackendEvent>,
        mut stop: oneshot::Receiver<()>,
        sweep_every: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.tick().await;

        let failed = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break false,
                _ = sweep.tick() => self.sweep().await,
                event = events.recv() => {
                    let Some(event) = event else { break false };
                    if let Err(e) = self.handle(event).await {
                        warn!(backend = %self.name, error = %e, "tunnel write failed");
                        break true;
                    }
                }
            }
        };

        self.teardown().await;
        if failed {
            unregister(&self.registry, self.name.clone(), self.instance).await;
        }
    }

    /// Errors returned here are tunnel failures; session-level failures are
    /// handled in place.
    async fn handle(&mut self, event: BackendEvent) -> DkResult<()> {
        match event {
            BackendEvent::Frame(frame) => self.on_frame(frame).await,
            BackendEvent::Bridge(req) => self.bridge(req).await,
            BackendEvent::Scan { port, reply } => {
                let id = self.replies.set(reply);
                debug!(backend = %self.name, port, id, "scan requested");
                let frame = Command::ScanRequest { id, port }.into_frame()?;
                self.tunnel.send_frame(&frame).await
            }
            BackendEvent::PumpClosed {
                session,
                generation,
            } => {
                if self.is_current(session, generation) {
                    self.close_session(session).await;
                    debug!(backend = %self.name, session = %format_args!("{session:08x}"), "client closed session");
                }
                Ok(())
            }
            BackendEvent::WriteFailed {
                session,
                generation,
            } => {
                if self.is_current(session, generation) {
                    self.close_session(session).await;
                    self.tunnel.send_frame(&Frame::close(session)).await?;
                }
                Ok(())
            }
        }
    }

    fn is_current(&self, session: SessionId, generation: u64) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|s| s.generation == generation)
    }

    async fn on_frame(&mut self, frame: Frame) -> DkResult<()> {
        match frame.chunk {
            ChunkType::Data => {
                let session = match frame.session_id() {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(backend = %self.name, error = %e, "malformed DATA dropped");
                        return Ok(());
                    }
                };
                let Some(s) = self.sessions.get(&session) else {
                    debug!(
                        backend = %self.name,
                        session = %format_args!("{session:08x}"),
                        bytes = frame.body().len(),
                        "data for unknown session dropped"
                    );
                    return Ok(());
                };
                if let Err(e) = s.writer.try_write(frame.body()) {
                    warn!(backend = %self.name, session = %format_args!("{session:08x}"), error = %e, "client write refused, closing session");
                    self.close_session(session).await;
                    self.tunnel.send_frame(&Frame::close(session)).await?;
                }
            }
            ChunkType::Close => match frame.session_id() {
                Ok(session) => {
                    if self.close_session(session).await {
                        debug!(backend = %self.name, session = %format_args!("{session:08x}"), "backend closed session");
                    }
                }
                Err(e) => debug!(backend = %self.name, error = %e, "malformed CLOSE dropped"),
            },
            ChunkType::Command => match Command::decode(&frame.payload, Origin::Backend) {
                Ok(Command::Ping) => debug!(backend = %self.name, "pong received"),
                Ok(Command::ScanReply { id, report }) => match self.replies.get(id) {
                    Some(tx) => {
                        let _ = tx.send(report);
                    }
                    None => debug!(backend = %self.name, id, "scan reply without waiter dropped"),
                },
                Ok(other) => debug!(backend = %self.name, ?other, "unexpected command dropped"),
                Err(e) => warn!(backend = %self.name, error = %e, "malformed command dropped"),
            },
            ChunkType::Open => debug!(backend = %self.name, "OPEN from backend dropped"),
        }
        Ok(())
    }

    async fn bridge(&mut self, req: ConnectionRequest) -> DkResult<()> {
        let ConnectionRequest {
            session,
            dest,
            client,
            ..
        } = req;
        if self.close_session(session).await {
            debug!(backend = %self.name, session = %format_args!("{session:08x}"), "stale session evicted");
        }

        self.tunnel.send_frame(&Frame::open(session, dest)).await?;

        let (reader, writer) = conn::split(client);
        let conn = Arc::new(Conn::new(writer));
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let writer = SessionWriter::spawn(conn.clone(), move |e| {
            debug!(session = %format_args!("{session:08x}"), error = %e, "client write failed");
            if let Some(tx) = events.upgrade() {
                let _ = tx.try_send(BackendEvent::WriteFailed {
                    session,
                    generation,
                });
            }
        });
        let pump = tokio::spawn(pump(
            session,
            generation,
            reader,
            conn.clone(),
            self.tunnel.clone(),
            self.events.clone(),
        ));
        self.sessions.insert(
            session,
            GatewaySession {
                conn,
                writer,
                pump,
                generation,
            },
        );
        info!(
            backend = %self.name,
            session = %format_args!("{session:08x}"),
            dest = %dest,
            "session opened"
        );
        Ok(())
    }

    /// Close and forget a session. Returns whether it existed.
    async fn close_session(&mut self, session: SessionId) -> bool {
        match self.sessions.remove(&session) {
            Some(s) => {
                s.close().await;
                true
            }
            None => false,
        }
    }

    async fn sweep(&mut self) {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.conn.idle(self.idle_close))
            .map(|(id, _)| *id)
            .collect();
        for session in idle {
            self.close_session(session).await;
            let _ = self.tunnel.send_frame(&Frame::close(session)).await;
            info!(backend = %self.name, session = %format_args!("{session:08x}"), "idle session closed");
        }
    }

    async fn teardown(&mut self) {
        let count = self.sessions.len();
        for (_, s) in self.sessions.drain() {
            s.close().await;
        }
        self.tunnel.close().await;
        info!(backend = %self.name, sessions = count, "backend tunnel closed");
    }
}

/// Copy client bytes into DATA frames until the client goes away, then tell
/// the backend with CLOSE. Idle sessions are evicted by the dispatcher's
/// sweep, which sees traffic in both directions.
async fn pump(
    session: SessionId,
    generation: u64,
    mut reader: BoxReader,
    conn: Arc<Conn>,
    tunnel: Arc<Conn>,
    events: mpsc::WeakSender<BackendEvent>,
) {
    let mut buf = vec![0u8; MAX_DATA];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                conn.touch();
                if let Err(e) = tunnel.send_frame(&Frame::data(session, &buf[..n])).await {
                    debug!(session = %format_args!("{session:08x}"), error = %e, "tunnel write failed");
                    break;
                }
            }
            Err(e) => {
                debug!(session = %format_args!("{session:08x}"), error = %e, "client read failed");
                break;
            }
        }
    }
    let _ = tunnel.send_frame(&Frame::close(session)).await;
    if let Some(tx) = events.upgrade() {
        let _ = tx.try_send(BackendEvent::PumpClosed {
            session,
            generation,
        });
    }
}
