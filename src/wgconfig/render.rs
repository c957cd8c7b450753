use crate::registry::Registry;
use crate::validate;
use crate::wgconfig::ConfigError;
use chrono::{DateTime, Utc};

const POST_UP_RULES: &[&str] = &[
    "iptables -A FORWARD -i %i -j ACCEPT",
    "iptables -A FORWARD -o %i -j ACCEPT",
    "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE",
];

const POST_DOWN_RULES: &[&str] = &[
    "iptables -D FORWARD -i %i -j ACCEPT",
    "iptables -D FORWARD -o %i -j ACCEPT",
    "iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE",
];

const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Clone)]
pub struct InterfaceSection {
    pub address: String,
    pub private_key: String,
    pub listen_port: u16,
    pub dns: String,
}

#[derive(Debug, Clone)]
pub struct PeerSection {
    pub node_id: String,
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: String,
}

/// A fully assembled tunnel configuration, ready to render as wg-quick INI.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub node_id: String,
    pub interface: InterfaceSection,
    pub peers: Vec<PeerSection>,
    pub generated_at: DateTime<Utc>,
}

/// Build the tunnel config for `self_node_id` from the registry: the local
/// node becomes the `[Interface]` and every other active peer a `[Peer]`.
pub fn build_config(
    registry: &Registry,
    self_node_id: &str,
    private_key: &str,
    listen_port: u16,
) -> Result<TunnelConfig, ConfigError> {
    let local = registry
        .peer_by_node_id(self_node_id)
        .ok_or_else(|| ConfigError::NodeNotInRegistry(self_node_id.to_string()))?;

    let peers = registry
        .active_peers()
        .filter(|p| p.node_id != self_node_id)
        .map(|p| PeerSection {
            node_id: p.node_id.clone(),
            public_key: p.public_key.clone(),
            allowed_ips: format!("{}/32", p.ip_address),
            endpoint: format!("{}:{}", p.hostname, listen_port),
        })
        .collect();

    Ok(TunnelConfig {
        node_id: self_node_id.to_string(),
        interface: InterfaceSection {
            address: format!("{}/24", local.ip_address),
            private_key: private_key.to_string(),
            listen_port,
            dns: registry.network.dns_server.clone(),
        },
        peers,
        generated_at: Utc::now(),
    })
}

impl TunnelConfig {
    /// Render as a wg-quick configuration file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("Address = {}\n", self.interface.address));
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
        out.push_str(&format!("ListenPort = {}\n", self.interface.listen_port));
        out.push_str(&format!("DNS = {}\n", self.interface.dns));
        out.push_str(&format!("PostUp = {}\n", POST_UP_RULES.join("; ")));
        out.push_str(&format!("PostDown = {}\n", POST_DOWN_RULES.join("; ")));

        for peer in &self.peers {
            out.push('\n');
            out.push_str(&format!("# {}\n", peer.node_id));
            out.push_str("[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips));
            out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
            out.push_str(&format!(
                "PersistentKeepalive = {}\n",
                PERSISTENT_KEEPALIVE_SECS
            ));
        }

        out.push('\n');
        out.push_str(&format!(
            "# Generated at {}\n",
            self.generated_at.to_rfc3339()
        ));
        out.push_str(&format!("# Node: {}\n", self.node_id));
        out.push_str(&format!("# Peers: {}\n", self.peers.len()));
        out
    }

    /// Structural checks applied before anything is written to disk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.private_key.trim().is_empty() {
            return Err(ConfigError::Invalid("missing private key".into()));
        }
        if !self.interface.address.ends_with("/24") {
            return Err(ConfigError::Invalid(format!(
                "interface address {} is not in the overlay subnet",
                self.interface.address
            )));
        }
        if self.interface.listen_port == 0 {
            return Err(ConfigError::Invalid("listen port must be non-zero".into()));
        }
        let mut seen_keys = std::collections::HashSet::new();
        for peer in &self.peers {
            validate::public_key(&peer.public_key)
                .map_err(|e| ConfigError::Invalid(format!("peer {}: {}", peer.node_id, e)))?;
            if !seen_keys.insert(peer.public_key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate public key on peer {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}
