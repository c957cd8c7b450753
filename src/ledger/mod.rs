//! Ledger connectivity for the access registry contract.
//!
//! Every remote read and write goes through the [`CallGateway`], which wraps
//! the raw RPC surface with retry/backoff and a short-TTL result cache.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │ LedgerRpc  │────▶│ CallGateway │────▶│ verifier / sync  │
//! │  (trait)   │     │ retry+cache │     │    consumers     │
//! └────────────┘     └─────────────┘     └──────────────────┘
//!        │                  │
//!        ▼                  ▼
//! ┌────────────┐     ┌─────────────┐
//! │ HttpLedger │     │  broadcast  │
//! │ (JSON-RPC) │     │ LedgerEvent │
//! └────────────┘     └─────────────┘
//! ```
//!
//! The gateway also runs an event pump that polls the ledger for mutation
//! events (grant/revoke/transfer) and republishes them on a broadcast
//! channel; the orchestrator reacts by invalidating caches and scheduling a
//! re-sync.

pub mod error;
pub mod gateway;
pub mod rpc;
pub mod types;

pub use error::{LedgerError, RATE_LIMIT_CODE};
pub use gateway::{CallGateway, GatewayStats, RetryPolicy};
pub use rpc::{HttpLedger, LedgerRpc};
pub use types::{AccessRecord, EventPage, LedgerEvent, MutationReceipt};
