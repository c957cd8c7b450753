//! WireGuard configuration management: rendering the interface config from
//! the peer registry, and applying it to disk with backup and rollback.

pub mod render;
pub mod writer;

pub use render::{build_config, InterfaceSection, PeerSection, TunnelConfig};
pub use writer::{ConfigWriter, ConfigWriterOptions, InterfaceStatus, WriterStats};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node {0} is not in the registry")]
    NodeNotInRegistry(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("no backup available to roll back to")]
    NoBackup,
    #[error("interface restart failed: {0}")]
    Restart(String),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}
