//! Backend authentication at tunnel bootstrap.
//!
//! The backend writes a fixed-size proof before any framed traffic. The
//! gateway checks it against every configured `(name, secret)` pair within
//! the handshake window. Failure gets no response; the caller just drops the
//! socket.

use dk_core::proof::{identify, PROOF_LEN};
use dk_core::{DkError, DkResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read a proof and return the backend name it authenticates.
pub async fn authenticate<R: AsyncRead + Unpin>(
    reader: &mut R,
    auths: &HashMap<String, String>,
    window: Duration,
) -> DkResult<String> {
    let mut proof = [0u8; PROOF_LEN];
    match tokio::time::timeout(window, reader.read_exact(&mut proof)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(DkError::Auth(format!("proof read failed: {e}"))),
        Err(_) => return Err(DkError::Auth("handshake timed out".into())),
    }
    identify(&proof, auths).ok_or_else(|| DkError::Auth("proof matches no backend".into()))
}
