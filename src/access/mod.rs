//! Access verification: answers "may this identity key reach this node?"
//! by walking the ledger through the call gateway, with a bounded FIFO
//! verdict cache in front.
//!
//! ```text
//!   verify(identity_key, node_id)
//!        |
//!        v
//!   +-------------+  hit   +---------+
//!   | FifoCache   |------->| verdict |
//!   +-------------+        +---------+
//!        | miss
//!        v
//!   +-------------+
//!   | CallGateway | tokenIdForNode -> getRecord -> ownerOf -> hasAccess
//!   +-------------+
//! ```

pub mod cache;
pub mod verifier;

pub use cache::FifoCache;
pub use verifier::{AccessVerdict, AccessVerifier, VerdictReason, VerifierStats};
