// Ledger-gated WireGuard overlay bridge.
//
// Reconciles an authoritative on-ledger access registry with a locally
// materialized WireGuard configuration and gates live connection attempts
// against that ledger.

use serde::{Deserialize, Serialize};

// Ledger call gateway and RPC surface
pub mod ledger;

// Access verification path and verdict cache
pub mod access;

// Durable peer registry and sync state machine
pub mod registry;

// Tunnel config rendering, backup and atomic replacement
pub mod wgconfig;

// Orchestrator lifecycle and health aggregation
pub mod bridge;

// Environment-driven configuration
pub mod settings;

// Synchronous input validation
pub mod validate;

/// Health classification reported by each component and the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Degraded => write!(f, "degraded"),
            Health::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl Health {
    /// Combine component healths into an aggregate: any unhealthy component
    /// makes the aggregate unhealthy, any degraded one makes it degraded.
    pub fn aggregate<I: IntoIterator<Item = Health>>(components: I) -> Health {
        let mut worst = Health::Healthy;
        for health in components {
            match health {
                Health::Unhealthy => return Health::Unhealthy,
                Health::Degraded => worst = Health::Degraded,
                Health::Healthy => {}
            }
        }
        worst
    }
}
