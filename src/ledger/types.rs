//! Types mirrored from the access registry contract surface.

use serde::{Deserialize, Serialize};

/// Access record stored on the ledger for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub node_id: String,
    /// WireGuard public key registered for the node (base64).
    pub public_key: String,
    /// Unix timestamp of mint time as recorded by the ledger.
    pub created_at: u64,
    pub is_active: bool,
}

/// Mutation event emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    Granted {
        token_id: u64,
        node_id: String,
        owner: String,
        public_key: String,
    },
    Revoked {
        token_id: u64,
        node_id: String,
    },
    Transferred {
        token_id: u64,
        from: String,
        to: String,
    },
}

impl LedgerEvent {
    pub fn token_id(&self) -> u64 {
        match self {
            LedgerEvent::Granted { token_id, .. }
            | LedgerEvent::Revoked { token_id, .. }
            | LedgerEvent::Transferred { token_id, .. } => *token_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::Granted { .. } => "granted",
            LedgerEvent::Revoked { .. } => "revoked",
            LedgerEvent::Transferred { .. } => "transferred",
        }
    }
}

/// One page of events returned by `access_pollEvents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    /// Cursor to pass on the next poll. Only advances on a successful poll.
    pub cursor: u64,
}

/// Receipt returned by signed (mutating) operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationReceipt {
    /// Token id assigned by a mint; absent for revocations.
    pub token_id: Option<u64>,
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_roundtrip() {
        let event = LedgerEvent::Granted {
            token_id: 7,
            node_id: "node-7".to_string(),
            owner: "0xabc".to_string(),
            public_key: "k".repeat(44),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"granted\""));
        let back: LedgerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.token_id(), 7);
    }
}
