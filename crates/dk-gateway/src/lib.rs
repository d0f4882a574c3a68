//! dk-gateway: the public side of a DoorKeeper deployment.
//!
//! Accepts authenticated backend tunnels, allocates per-destination adapter
//! ports for authorized clients and multiplexes their sessions over the
//! tunnel of the backend they target.

pub mod adapter;
pub mod config;
pub mod handshake;
pub mod registry;
pub mod replies;
pub mod server;

pub use adapter::{AdapterHandle, Grant};
pub use config::GatewayConfig;
pub use registry::{BackendInfo, ConnectionRequest, RegistryHandle};
pub use server::Gateway;
