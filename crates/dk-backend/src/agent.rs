//! Backend agent: keeps one authenticated tunnel to the gateway open and
//! serves it with a [`Relay`].

use crate::config::BackendConfig;
use crate::relay::{Relay, RelayEvent, RELAY_QUEUE};
use crate::scan::{LanScanner, NoScanner};
use dk_core::conn::{self, BoxReader, Conn, Socket};
use dk_core::frame::recv_frame;
use dk_core::{new_proof, DkError, DkResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

/// Pause between a lost tunnel and the next dial.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long the relay gets to close its sessions after the tunnel is gone.
const RELAY_GRACE: Duration = Duration::from_secs(5);

pub struct Agent {
    config: BackendConfig,
    scanner: Arc<dyn LanScanner>,
}

impl Agent {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            scanner: Arc::new(NoScanner),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn LanScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Dial, authenticate and serve the tunnel, forever.
    pub async fn run(&self) -> DkResult<()> {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    info!(backend = %self.config.name, gateway = %self.config.ctrl_addr(), "tunnel established");
                    match self.serve(stream).await {
                        Ok(()) => info!("tunnel closed by gateway"),
                        Err(e) => warn!(error = %e, "tunnel failed"),
                    }
                }
                Err(e) => warn!(gateway = %self.config.ctrl_addr(), error = %e, "connect failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Dial the gateway and send the handshake proof.
    pub async fn connect(&self) -> DkResult<TcpStream> {
        let wait = self.config.conn_wait;
        let mut stream = tokio::time::timeout(wait, TcpStream::connect(self.config.ctrl_addr())).await??;
        stream.set_nodelay(true)?;
        let proof = new_proof(&self.config.name, &self.config.auth);
        tokio::time::timeout(wait, stream.write_all(&proof)).await??;
        Ok(stream)
    }

    /// Serve an authenticated tunnel until it fails. A clean close by the
    /// gateway returns `Ok`.
    pub async fn serve<S: Socket>(&self, stream: S) -> DkResult<()> {
        let (mut reader, writer) = conn::split(Box::new(stream));
        let tunnel = Arc::new(Conn::new(writer));
        let (tx, rx) = mpsc::channel(RELAY_QUEUE);
        let relay = Relay::new(
            tunnel.clone(),
            tx.downgrade(),
            self.config.dial_timeout,
            self.scanner.clone(),
        );
        let mut relay_task = tokio::spawn(relay.run(rx));

        let outcome = tokio::select! {
            e = read_loop(&mut reader, self.config.read_timeout, &tx) => Err(e),
            res = &mut relay_task => match res {
                Ok(r) => r,
                Err(e) => Err(DkError::Other(format!("relay task failed: {e}"))),
            },
        };

        drop(tx);
        if !relay_task.is_finished() {
            let abort = relay_task.abort_handle();
            if tokio::time::timeout(RELAY_GRACE, relay_task).await.is_err() {
                abort.abort();
            }
        }
        tunnel.close().await;

        match outcome {
            Err(DkError::Closed) => Ok(()),
            other => other,
        }
    }
}

async fn read_loop(
    reader: &mut BoxReader,
    wait: Duration,
    events: &mpsc::Sender<RelayEvent>,
) -> DkError {
    loop {
        match recv_frame(reader, wait).await {
            Ok(frame) => match events.try_send(RelayEvent::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("relay queue full, frame dropped"),
                Err(TrySendError::Closed(_)) => return DkError::Closed,
            },
            Err(e) => return e,
        }
    }
}
