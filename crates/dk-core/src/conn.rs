//! Transport connection: the write half of one socket, serialized behind a
//! lock, with a bounded backlog for bytes sent before the socket exists.
//!
//! Reads are not owned here. Each socket has exactly one reader task which
//! uses [`crate::frame::recv_frame`] (tunnels) or plain reads (sessions).
//!
//! Session sockets are fed through a [`SessionWriter`], so a peer that stops
//! reading only ever stalls its own writer task.

use crate::error::{DkError, DkResult};
use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Most entries an unattached connection will hold.
pub const BACKLOG_CAP: usize = 1024;

/// Deadline applied to each write.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Any byte stream a tunnel or session can run over.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Socket for T {}

pub type BoxSocket = Box<dyn Socket>;
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a socket into boxed halves.
pub fn split(socket: BoxSocket) -> (BoxReader, BoxWriter) {
    let (r, w) = tokio::io::split(socket);
    (Box::new(r), Box::new(w))
}

struct State {
    writer: Option<BoxWriter>,
    backlog: VecDeque<Vec<u8>>,
    closed: bool,
}

pub struct Conn {
    state: Mutex<State>,
    last_used: StdMutex<Instant>,
    wait: Duration,
}

impl Conn {
    /// A connection with no socket yet; sends queue in the backlog.
    pub fn pending() -> Self {
        Self::build(None)
    }

    pub fn new(writer: BoxWriter) -> Self {
        Self::build(Some(writer))
    }

    fn build(writer: Option<BoxWriter>) -> Self {
        Self {
            state: Mutex::new(State {
                writer,
                backlog: VecDeque::new(),
                closed: false,
            }),
            last_used: StdMutex::new(Instant::now()),
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Write `bytes`, or queue them if no socket is attached yet.
    ///
    /// A full backlog drops `bytes` (the newest entry) and still returns `Ok`.
    pub async fn send(&self, bytes: &[u8]) -> DkResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(DkError::Closed);
        }
        let Some(writer) = state.writer.as_mut() else {
            if state.backlog.len() >= BACKLOG_CAP {
                tracing::warn!(len = bytes.len(), "backlog full, dropping newest entry");
            } else {
                state.backlog.push_back(bytes.to_vec());
            }
            return Ok(());
        };
        write_with_deadline(writer, bytes, self.wait).await?;
        drop(state);
        self.touch();
        Ok(())
    }

    pub async fn send_frame(&self, frame: &Frame) -> DkResult<()> {
        let buf = frame.encode()?;
        self.send(&buf).await
    }

    /// Attach a socket, flushing the backlog in order before any later send.
    pub async fn connect(&self, mut writer: BoxWriter) -> DkResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            let _ = writer.shutdown().await;
            return Err(DkError::Closed);
        }
        while let Some(bytes) = state.backlog.pop_front() {
            write_with_deadline(&mut writer, &bytes, self.wait).await?;
        }
        state.writer = Some(writer);
        drop(state);
        self.touch();
        Ok(())
    }

    /// Shut the socket down and discard anything still queued. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.backlog.clear();
        if let Some(mut writer) = state.writer.take() {
            let _ = tokio::time::timeout(self.wait, writer.shutdown()).await;
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.writer.is_some()
    }

    pub async fn backlog_len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }

    /// Record activity that did not go through [`Conn::send`], such as a read.
    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Whether nothing has been transferred for longer than `threshold`.
    pub fn idle(&self, threshold: Duration) -> bool {
        let last = *self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        last.elapsed() > threshold
    }
}

/// Entries a [`SessionWriter`] holds before refusing more.
pub const WRITE_QUEUE: usize = BACKLOG_CAP;

/// Drains a bounded queue into one [`Conn`] from a dedicated task.
pub struct SessionWriter {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl SessionWriter {
    /// `on_error` runs once, from the writer task, if a write fails.
    pub fn spawn<F>(conn: Arc<Conn>, on_error: F) -> Self
    where
        F: FnOnce(DkError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
        let task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = conn.send(&bytes).await {
                    on_error(e);
                    return;
                }
            }
        });
        Self { tx, task }
    }

    /// Queue `bytes` without waiting. Fails with [`DkError::Overflow`] when
    /// the queue is full and [`DkError::Closed`] once the writer has stopped.
    pub fn try_write(&self, bytes: &[u8]) -> DkResult<()> {
        match self.tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DkError::Overflow),
            Err(TrySendError::Closed(_)) => Err(DkError::Closed),
        }
    }

    /// Abort the writer task; queued bytes are discarded. Call before
    /// [`Conn::close`] so the close never waits behind a stuck write.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn write_with_deadline(writer: &mut BoxWriter, bytes: &[u8], wait: Duration) -> DkResult<()> {
    tokio::time::timeout(wait, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await??;
    Ok(())
}
