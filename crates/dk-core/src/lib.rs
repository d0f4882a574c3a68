//! dk-core: Shared protocol library for DoorKeeper.
//!
//! Provides the chunk frame codec, COMMAND payloads, the transport connection
//! with its pending backlog, the handshake proof used by backends, and the
//! config helpers both daemons share.

pub mod command;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod name;
pub mod proof;

// Re-export commonly used items at crate root.
pub use command::{Command, Origin, ScanReport};
pub use config::{expand_tilde, in_range};
pub use conn::{BoxReader, BoxSocket, BoxWriter, Conn, SessionWriter, Socket};
pub use error::{DkError, DkResult};
pub use frame::{ChunkType, Frame, SessionId, MTU};
pub use name::validate_name;
pub use proof::{identify, new_proof, PROOF_LEN};
