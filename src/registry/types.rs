use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REGISTRY_VERSION: &str = "2.0";

/// One overlay peer, derived from a ledger access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: String,
    pub public_key: String,
    pub ip_address: String,
    pub hostname: String,
    pub owner_address: String,
    pub token_id: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub cidr: String,
    pub dns_server: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/24".to_string(),
            dns_server: "10.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub version: String,
    pub contract_address: String,
    pub network: NetworkSettings,
    pub last_sync: DateTime<Utc>,
    pub peers: Vec<Peer>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            contract_address: String::new(),
            network: NetworkSettings::default(),
            last_sync: Utc::now(),
            peers: Vec::new(),
        }
    }
}

impl Registry {
    /// Structural sanity check applied after loading from disk. A fresh
    /// never-synced registry has no contract address and does not pass.
    pub fn is_valid(&self) -> bool {
        self.version == REGISTRY_VERSION
            && !self.contract_address.is_empty()
            && self
                .peers
                .iter()
                .all(|p| !p.node_id.is_empty() && !p.public_key.is_empty())
    }

    pub fn peer_by_node_id(&self, node_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    pub fn peer_by_public_key(&self, public_key: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    pub fn peer_by_ip(&self, ip_address: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.ip_address == ip_address)
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.active)
    }

    /// Owner lookup is case-insensitive since ledger addresses arrive in
    /// mixed checksum casing.
    pub fn peers_by_owner(&self, owner: &str) -> Vec<&Peer> {
        self.peers
            .iter()
            .filter(|p| p.owner_address.eq_ignore_ascii_case(owner))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: &str, ip: &str, owner: &str, active: bool) -> Peer {
        Peer {
            node_id: node_id.to_string(),
            public_key: format!("key-{node_id}"),
            ip_address: ip.to_string(),
            hostname: format!("{node_id}.vpn.mesh"),
            owner_address: owner.to_string(),
            token_id: 1,
            active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lookups_and_owner_case_insensitivity() {
        let mut registry = Registry::default();
        registry.peers.push(peer("alpha", "10.0.0.2", "0xAbCd", true));
        registry.peers.push(peer("beta", "10.0.0.3", "0xabcd", false));

        assert!(registry.peer_by_node_id("alpha").is_some());
        assert!(registry.peer_by_ip("10.0.0.3").is_some());
        assert!(registry.peer_by_public_key("key-alpha").is_some());
        assert_eq!(registry.active_peers().count(), 1);
        assert_eq!(registry.peers_by_owner("0XABCD").len(), 2);
    }

    #[test]
    fn validity_requires_version_contract_and_identities() {
        let mut registry = Registry::default();
        // Never synced: no contract address yet.
        assert!(!registry.is_valid());

        registry.contract_address = "0xabc".to_string();
        assert!(registry.is_valid());

        registry.version = "1.0".to_string();
        assert!(!registry.is_valid());

        registry.version = REGISTRY_VERSION.to_string();
        let mut bad = peer("x", "10.0.0.2", "0x1", true);
        bad.public_key.clear();
        registry.peers.push(bad);
        assert!(!registry.is_valid());
    }
}
