use thiserror::Error;

/// Errors produced by the DoorKeeper protocol and runtime layers.
#[derive(Debug, Error)]
pub enum DkError {
    /// A frame would exceed the MTU once the header is added.
    #[error("invalid chunk: {0} bytes exceeds MTU")]
    InvalidChunk(usize),

    /// Malformed frame, bad payload layout or short read.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o timed out")]
    IoTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("adapter capacity reached ({0} in use)")]
    Capacity(usize),

    #[error("no such backend: {0}")]
    NoSuchBackend(String),

    /// A registry or manager did not answer within the reply window.
    #[error("no reply")]
    Timeout,

    #[error("connection closed")]
    Closed,

    /// A per-session write queue had no room left.
    #[error("write queue full")]
    Overflow,

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for DkError {
    fn from(e: serde_json::Error) -> Self {
        DkError::Protocol(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DkError::IoTimeout
    }
}

pub type DkResult<T> = Result<T, DkError>;
