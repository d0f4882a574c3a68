//! Session relay: the backend half of the multiplexer.
//!
//! One loop owns the session table. OPEN registers a placeholder whose
//! connection queues DATA in its backlog while the destination is dialed in
//! a separate task. That task also flushes the backlog, then reports back to
//! the loop with [`RelayEvent::Attached`]. Each attached session gets a pump
//! that copies destination bytes into DATA frames and ends with CLOSE.
//!
//! The loop never writes to a destination socket: DATA goes through the
//! session's own [`SessionWriter`].

use crate::scan::{run_scan, LanScanner, SCAN_TIMEOUT};
use dk_core::conn::{self, BoxReader, Conn, SessionWriter};
use dk_core::frame::MAX_DATA;
use dk_core::{ChunkType, Command, DkError, DkResult, Frame, Origin, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the relay queue.
pub const RELAY_QUEUE: usize = 1024;

/// Items consumed by the relay loop. Only `Frame` comes off the wire.
pub enum RelayEvent {
    Frame(Frame),
    Attached {
        session: SessionId,
        generation: u64,
        result: DkResult<Attachment>,
    },
    PumpEnded {
        session: SessionId,
        generation: u64,
    },
    WriteFailed {
        session: SessionId,
        generation: u64,
    },
}

/// A dialed destination whose backlog has already been flushed.
pub struct Attachment {
    reader: BoxReader,
    peer: Option<SocketAddr>,
}

struct RelaySession {
    conn: Arc<Conn>,
    writer: SessionWriter,
    generation: u64,
    dial: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl RelaySession {
    fn stop(&self) {
        if let Some(dial) = &self.dial {
            dial.abort();
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
        self.writer.stop();
    }

    async fn close(self) {
        self.stop();
        self.conn.close().await;
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Relay {
    tunnel: Arc<Conn>,
    sessions: HashMap<SessionId, RelaySession>,
    next_generation: u64,
    dial_timeout: Duration,
    scanner: Arc<dyn LanScanner>,
    events: mpsc::WeakSender<RelayEvent>,
}

impl Relay {
    pub fn new(
        tunnel: Arc<Conn>,
        events: mpsc::WeakSender<RelayEvent>,
        dial_timeout: Duration,
        scanner: Arc<dyn LanScanner>,
    ) -> Self {
        Self {
            tunnel,
            sessions: HashMap::new(),
            next_generation: 0,
            dial_timeout,
            scanner,
            events,
        }
    }

    /// Process events until the queue closes. An error means the tunnel can
    /// no longer be written.
    pub async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>) -> DkResult<()> {
        let mut result = Ok(());
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                result = Err(e);
                break;
            }
        }
        let count = self.sessions.len();
        for (_, s) in self.sessions.drain() {
            s.close().await;
        }
        debug!(sessions = count, "relay stopped");
        result
    }

    async fn handle(&mut self, event: RelayEvent) -> DkResult<()> {
        match event {
            RelayEvent::Frame(frame) => self.on_frame(frame).await,
            RelayEvent::Attached {
                session,
                generation,
                result,
            } => self.attach(session, generation, result).await,
            RelayEvent::PumpEnded {
                session,
                generation,
            } => {
                if self.is_current(session, generation) {
                    self.close_session(session).await;
                }
                Ok(())
            }
            RelayEvent::WriteFailed {
                session,
                generation,
            } => {
                if self.is_current(session, generation) {
                    self.close_session(session).await;
                    return self.tunnel.send_frame(&Frame::close(session)).await;
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
            ChunkType::Open => match frame.open_target() {
                Ok((session, dest)) => self.open(session, dest).await,
                Err(e) => debug!(error = %e, "malformed OPEN dropped"),
            },
            ChunkType::Data => {
                let session = match frame.session_id() {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(error = %e, "malformed DATA dropped");
                        return Ok(());
                    }
                };
                let Some(s) = self.sessions.get(&session) else {
                    debug!(
                        session = %format_args!("{session:08x}"),
                        bytes = frame.body().len(),
                        "data for unknown session dropped"
                    );
                    return self.tunnel.send_frame(&Frame::close(session)).await;
                };
                if let Err(e) = s.writer.try_write(frame.body()) {
                    warn!(session = %format_args!("{session:08x}"), error = %e, "destination write refused, closing session");
                    self.close_session(session).await;
                    return self.tunnel.send_frame(&Frame::close(session)).await;
                }
            }
            ChunkType::Close => match frame.session_id() {
                Ok(session) => {
                    if self.close_session(session).await {
                        debug!(session = %format_args!("{session:08x}"), "gateway closed session");
                    }
                }
                Err(e) => debug!(error = %e, "malformed CLOSE dropped"),
            },
            ChunkType::Command => match Command::decode(&frame.payload, Origin::Gateway) {
                Ok(Command::Ping) => {
                    debug!("ping received");
                    return self.tunnel.send_frame(&Command::ping()).await;
                }
                Ok(Command::ScanRequest { id, port }) => self.scan(id, port),
                Ok(other) => debug!(?other, "unexpected command dropped"),
                Err(e) => warn!(error = %e, "malformed command dropped"),
            },
        }
        Ok(())
    }

    async fn open(&mut self, session: SessionId, dest: SocketAddr) {
        if self.close_session(session).await {
            debug!(session = %format_args!("{session:08x}"), "stale session evicted");
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let conn = Arc::new(Conn::pending());

        let events = self.events.clone();
        let writer = SessionWriter::spawn(conn.clone(), move |e| {
            debug!(session = %format_args!("{session:08x}"), error = %e, "destination write failed");
            if let Some(tx) = events.upgrade() {
                let _ = tx.try_send(RelayEvent::WriteFailed {
                    session,
                    generation,
                });
            }
        });

        let dial = tokio::spawn(dial(
            session,
            generation,
            dest,
            self.dial_timeout,
            conn.clone(),
            self.events.clone(),
        ));
        self.sessions.insert(
            session,
            RelaySession {
                conn,
                writer,
                generation,
                dial: Some(dial),
                pump: None,
            },
        );
        debug!(session = %format_args!("{session:08x}"), dest = %dest, "dialing");
    }

    async fn attach(
        &mut self,
        session: SessionId,
        generation: u64,
        result: DkResult<Attachment>,
    ) -> DkResult<()> {
        let Some(conn) = self
            .sessions
            .get(&session)
            .filter(|s| s.generation == generation)
            .map(|s| s.conn.clone())
        else {
            debug!(session = %format_args!("{session:08x}"), "dial finished for a closed session");
            return Ok(());
        };
        let Attachment { reader, peer } = match result {
            Ok(attachment) => attachment,
            Err(e) => {
                info!(session = %format_args!("{session:08x}"), error = %e, "destination unreachable");
                self.close_session(session).await;
                return self.tunnel.send_frame(&Frame::close(session)).await;
            }
        };

        let pump = tokio::spawn(pump(
            session,
            generation,
            reader,
            conn,
            self.tunnel.clone(),
            self.events.clone(),
        ));
        if let Some(s) = self.sessions.get_mut(&session) {
            s.dial = None;
            s.pump = Some(pump);
        }
        info!(session = %format_args!("{session:08x}"), dest = ?peer, "session attached");
        Ok(())
    }

    fn scan(&self, id: u32, port: u16) {
        let scanner = self.scanner.clone();
        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            let report = run_scan(scanner.as_ref(), port, SCAN_TIMEOUT).await;
            let sent = match (Command::ScanReply { id, report }).into_frame() {
                Ok(frame) => tunnel.send_frame(&frame).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(port, error = %e, "scan reply failed");
            }
        });
    }

    async fn close_session(&mut self, session: SessionId) -> bool {
        match self.sessions.remove(&session) {
            Some(s) => {
                s.close().await;
                true
            }
            None => false,
        }
    }
}

/// Dial `dest`, attach the write half to `conn` (flushing its backlog) and
/// hand the read half back to the relay loop.
async fn dial(
    session: SessionId,
    generation: u64,
    dest: SocketAddr,
    wait: Duration,
    conn: Arc<Conn>,
    events: mpsc::WeakSender<RelayEvent>,
) {
    let result = async {
        let stream = tokio::time::timeout(wait, TcpStream::connect(dest)).await??;
        let peer = stream.peer_addr().ok();
        let (reader, writer) = conn::split(Box::new(stream));
        conn.connect(writer).await?;
        Ok::<_, DkError>(Attachment { reader, peer })
    }
    .await;
    if let Some(tx) = events.upgrade() {
        let _ = tx
            .send(RelayEvent::Attached {
                session,
                generation,
                result,
            })
            .await;
    }
}

async fn pump(
    session: SessionId,
    generation: u64,
    mut reader: BoxReader,
    conn: Arc<Conn>,
    tunnel: Arc<Conn>,
    events: mpsc::WeakSender<RelayEvent>,
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
                debug!(session = %format_args!("{session:08x}"), error = %e, "destination read failed");
                break;
            }
        }
    }
    let _ = tunnel.send_frame(&Frame::close(session)).await;
    if let Some(tx) = events.upgrade() {
        let _ = tx.try_send(RelayEvent::PumpEnded {
            session,
            generation,
        });
    }
}
