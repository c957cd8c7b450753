//! Peer registry: the locally persisted view of which ledger tokens map to
//! which overlay peers, rebuilt from token scans and kept on disk as JSON.

pub mod store;
pub mod sync;
pub mod types;

pub use store::RegistryStore;
pub use sync::{RegistrySync, SyncOptions, SyncOutcome, SyncStats, SyncStatus};
pub use types::{NetworkSettings, Peer, Registry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no free address left in the overlay subnet")]
    NoAddressAvailable,
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
}
