//! dk-backend: the agent that runs inside the private network.
//!
//! Dials out to the gateway, proves its identity, then relays each session
//! the gateway opens to its real destination on the LAN.

pub mod agent;
pub mod config;
pub mod relay;
pub mod scan;

pub use agent::Agent;
pub use config::BackendConfig;
pub use scan::{LanScanner, NoScanner};
