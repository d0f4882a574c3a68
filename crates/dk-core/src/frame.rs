//! Length-prefixed chunk framing for the tunnel.
//!
//! Wire format: `[2-byte big-endian header][payload]`. The top two bits of the
//! header carry the [`ChunkType`], the low 14 bits the total frame length
//! (header included), which never exceeds [`MTU`].
//!
//! Payload layouts:
//!
//! | Chunk   | Payload                                             |
//! |---------|-----------------------------------------------------|
//! | CLOSE   | `session:4`                                         |
//! | OPEN    | `session:4` `port:2` `ip:4|16`                      |
//! | DATA    | `session:4` raw bytes                               |
//! | COMMAND | see [`crate::command`]                              |

use crate::error::{DkError, DkResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum size of one frame on the wire, header included.
pub const MTU: usize = 8192;
pub const HEADER_LEN: usize = 2;
pub const MAX_PAYLOAD: usize = MTU - HEADER_LEN;
pub const SESSION_ID_LEN: usize = 4;
/// Largest DATA body that fits in a single frame after the session id.
pub const MAX_DATA: usize = MAX_PAYLOAD - SESSION_ID_LEN;

const LENGTH_MASK: u16 = 0x3FFF;
const TYPE_SHIFT: u16 = 14;

/// Identifier of one multiplexed session inside a tunnel.
pub type SessionId = u32;

/// The four chunk types that can appear on the wire.
///
/// Signals that never leave the process (dial results, sweep ticks) are
/// modelled by the queues that carry frames, not here, so they cannot be
/// encoded by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    Close = 0,
    Open = 1,
    Data = 2,
    Command = 3,
}

impl ChunkType {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => ChunkType::Close,
            1 => ChunkType::Open,
            2 => ChunkType::Data,
            _ => ChunkType::Command,
        }
    }
}

/// One protocol unit: a chunk type plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub chunk: ChunkType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(chunk: ChunkType, payload: Vec<u8>) -> Self {
        Self { chunk, payload }
    }

    pub fn close(session: SessionId) -> Self {
        Self::new(ChunkType::Close, session.to_be_bytes().to_vec())
    }

    /// OPEN asking the backend to dial `dest` for `session`.
    pub fn open(session: SessionId, dest: SocketAddr) -> Self {
        let mut payload = Vec::with_capacity(SESSION_ID_LEN + 2 + 16);
        payload.extend_from_slice(&session.to_be_bytes());
        payload.extend_from_slice(&dest.port().to_be_bytes());
        match dest.ip() {
            IpAddr::V4(ip) => payload.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => payload.extend_from_slice(&ip.octets()),
        }
        Self::new(ChunkType::Open, payload)
    }

    pub fn data(session: SessionId, bytes: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(SESSION_ID_LEN + bytes.len());
        payload.extend_from_slice(&session.to_be_bytes());
        payload.extend_from_slice(bytes);
        Self::new(ChunkType::Data, payload)
    }

    /// Encode to wire bytes; fails with [`DkError::InvalidChunk`] above the MTU.
    pub fn encode(&self) -> DkResult<Vec<u8>> {
        encode(self.chunk, &self.payload)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or the
    /// frame and the number of bytes it consumed.
    pub fn decode(buf: &[u8]) -> DkResult<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let (chunk, len) = decode_header([buf[0], buf[1]])?;
        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((Frame::new(chunk, buf[HEADER_LEN..total].to_vec()), total)))
    }

    /// Session id carried in the first four payload bytes.
    pub fn session_id(&self) -> DkResult<SessionId> {
        match self.payload.get(..SESSION_ID_LEN) {
            Some(id) => Ok(u32::from_be_bytes([id[0], id[1], id[2], id[3]])),
            None => Err(DkError::Protocol(format!(
                "{:?} frame too short for a session id ({} bytes)",
                self.chunk,
                self.payload.len()
            ))),
        }
    }

    /// Bytes following the session id (DATA body).
    pub fn body(&self) -> &[u8] {
        self.payload.get(SESSION_ID_LEN..).unwrap_or(&[])
    }

    /// Parse an OPEN payload into its session id and destination.
    pub fn open_target(&self) -> DkResult<(SessionId, SocketAddr)> {
        let session = self.session_id()?;
        let dest = self.body();
        let (port, ip) = match dest.len() {
            6 => {
                let octets: [u8; 4] = [dest[2], dest[3], dest[4], dest[5]];
                (
                    u16::from_be_bytes([dest[0], dest[1]]),
                    IpAddr::V4(Ipv4Addr::from(octets)),
                )
            }
            18 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&dest[2..]);
                (
                    u16::from_be_bytes([dest[0], dest[1]]),
                    IpAddr::V6(Ipv6Addr::from(octets)),
                )
            }
            n => {
                return Err(DkError::Protocol(format!(
                    "invalid OPEN destination ({n} bytes)"
                )))
            }
        };
        Ok((session, SocketAddr::new(ip, port)))
    }
}

/// Encode a chunk type and payload into one wire frame.
pub fn encode(chunk: ChunkType, payload: &[u8]) -> DkResult<Vec<u8>> {
    let total = payload.len() + HEADER_LEN;
    if total > MTU {
        return Err(DkError::InvalidChunk(total));
    }
    let header = ((chunk as u16) << TYPE_SHIFT) | (total as u16 & LENGTH_MASK);
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&header.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a header into its chunk type and the payload length that follows.
pub fn decode_header(header: [u8; HEADER_LEN]) -> DkResult<(ChunkType, usize)> {
    let raw = u16::from_be_bytes(header);
    let chunk = ChunkType::from_bits(raw >> TYPE_SHIFT);
    let total = (raw & LENGTH_MASK) as usize;
    if !(HEADER_LEN..=MTU).contains(&total) {
        return Err(DkError::Protocol(format!("invalid frame length {total}")));
    }
    Ok((chunk, total - HEADER_LEN))
}

/// Read exactly one frame. A clean EOF before the header is [`DkError::Closed`];
/// EOF inside a frame is a short read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> DkResult<Frame> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(DkError::Closed),
        Err(e) => return Err(e.into()),
    }
    let (chunk, len) = decode_header(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DkError::Protocol(format!("short read: expected {len} payload bytes"))
        } else {
            DkError::Io(e)
        }
    })?;
    Ok(Frame::new(chunk, payload))
}

/// [`read_frame`] bounded by `wait`.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R, wait: Duration) -> DkResult<Frame> {
    tokio::time::timeout(wait, read_frame(reader)).await?
}
