//! CLI subcommand implementations.

pub mod backend;
pub mod init;
