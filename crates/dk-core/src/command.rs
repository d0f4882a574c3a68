//! COMMAND chunk payloads.
//!
//! Layouts (first byte is the opcode):
//! - `[0]` ping, answered with the same bytes as pong
//! - `[1][corr_id:4][port:2]` scan request, gateway to backend
//! - `[1][corr_id:4][json]` scan reply, backend to gateway

use crate::error::{DkError, DkResult};
use crate::frame::{ChunkType, Frame, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

pub const OP_PING: u8 = 0;
pub const OP_SCAN: u8 = 1;

const SCAN_HEADER_LEN: usize = 1 + 4;

/// Which side of the tunnel sent a COMMAND. Opcode 1 means different
/// things depending on direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Gateway,
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    ScanRequest { id: u32, port: u16 },
    ScanReply { id: u32, report: ScanReport },
}

impl Command {
    pub fn encode(&self) -> DkResult<Vec<u8>> {
        let payload = match self {
            Command::Ping => vec![OP_PING],
            Command::ScanRequest { id, port } => {
                let mut buf = Vec::with_capacity(SCAN_HEADER_LEN + 2);
                buf.push(OP_SCAN);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Command::ScanReply { id, report } => {
                let body = report.to_json(MAX_PAYLOAD - SCAN_HEADER_LEN)?;
                let mut buf = Vec::with_capacity(SCAN_HEADER_LEN + body.len());
                buf.push(OP_SCAN);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&body);
                buf
            }
        };
        Ok(payload)
    }

    pub fn into_frame(self) -> DkResult<Frame> {
        Ok(Frame::new(ChunkType::Command, self.encode()?))
    }

    /// Keep-alive frame, sent by the gateway and echoed by the backend.
    pub fn ping() -> Frame {
        Frame::new(ChunkType::Command, vec![OP_PING])
    }

    /// Parse a COMMAND payload sent by `origin`.
    pub fn decode(payload: &[u8], origin: Origin) -> DkResult<Self> {
        let (&op, rest) = payload
            .split_first()
            .ok_or_else(|| DkError::Protocol("empty command".into()))?;
        match op {
            OP_PING => Ok(Command::Ping),
            OP_SCAN => {
                if rest.len() < 4 {
                    return Err(DkError::Protocol("scan command without id".into()));
                }
                let id = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let body = &rest[4..];
                match origin {
                    Origin::Gateway => match body {
                        [hi, lo] => Ok(Command::ScanRequest {
                            id,
                            port: u16::from_be_bytes([*hi, *lo]),
                        }),
                        _ => Err(DkError::Protocol(format!(
                            "scan request body is {} bytes",
                            body.len()
                        ))),
                    },
                    Origin::Backend => Ok(Command::ScanReply {
                        id,
                        report: serde_json::from_slice(body)?,
                    }),
                }
            }
            other => Err(DkError::Protocol(format!("unknown command opcode {other}"))),
        }
    }
}

/// Result of a LAN port scan, as carried in a scan reply and handed to
/// collaborators unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub stat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesg: Option<String>,
}

impl ScanReport {
    /// Hosts that answered on `port`, sorted. An empty list is reported as a
    /// failure with an explanatory message.
    pub fn hosts(mut hosts: Vec<String>, port: u16) -> Self {
        if hosts.is_empty() {
            return Self::failure(format!("no host opens port {port}"));
        }
        hosts.sort();
        Self {
            stat: true,
            data: Some(hosts),
            mesg: None,
        }
    }

    pub fn failure(mesg: impl Into<String>) -> Self {
        Self {
            stat: false,
            data: None,
            mesg: Some(mesg.into()),
        }
    }

    /// Serialize, dropping hosts from the tail until the body fits in `limit`.
    fn to_json(&self, limit: usize) -> DkResult<Vec<u8>> {
        let mut report = self.clone();
        loop {
            let body = serde_json::to_vec(&report)?;
            if body.len() <= limit {
                return Ok(body);
            }
            match report.data.as_mut() {
                Some(hosts) if !hosts.is_empty() => {
                    hosts.pop();
                }
                _ => return Err(DkError::InvalidChunk(body.len() + SCAN_HEADER_LEN)),
            }
        }
    }
}
