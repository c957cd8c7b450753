use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use wgbridge::ledger::{
    AccessRecord, EventPage, LedgerError, LedgerEvent, LedgerRpc, MutationReceipt,
};
use wgbridge::settings::Settings;

pub fn wg_key(fill: u8) -> String {
    STANDARD.encode([fill; 32])
}

pub fn owner(n: u64) -> String {
    format!("0x{n:040x}")
}

/// Programmable in-memory ledger shared across integration tests.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
    pub rpc_calls: AtomicU64,
}

#[derive(Default)]
struct MockState {
    records: HashMap<u64, AccessRecord>,
    owners: HashMap<u64, String>,
    node_tokens: HashMap<String, u64>,
    grants: HashMap<(String, String), bool>,
    pending_events: Vec<LedgerEvent>,
    cursor: u64,
    network_down: bool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, token_id: u64, node_id: &str, public_key: &str, owner: &str) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            token_id,
            AccessRecord {
                node_id: node_id.to_string(),
                public_key: public_key.to_string(),
                created_at: 1_700_000_000,
                is_active: true,
            },
        );
        state.owners.insert(token_id, owner.to_string());
        state.node_tokens.insert(node_id.to_string(), token_id);
        state
            .grants
            .insert((owner.to_string(), node_id.to_string()), true);
    }

    pub fn deactivate(&self, token_id: u64) {
        if let Some(record) = self.state.lock().unwrap().records.get_mut(&token_id) {
            record.is_active = false;
        }
    }

    pub fn push_event(&self, event: LedgerEvent) {
        self.state.lock().unwrap().pending_events.push(event);
    }

    pub fn set_network_down(&self, down: bool) {
        self.state.lock().unwrap().network_down = down;
    }

    fn check_network(&self) -> Result<(), LedgerError> {
        if self.state.lock().unwrap().network_down {
            Err(LedgerError::NetworkUnavailable("mock outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn token_id_for_node(&self, node_id: &str) -> Result<u64, LedgerError> {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.check_network()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_tokens
            .get(node_id)
            .copied()
            .unwrap_or(0))
    }

    async fn access_record(&self, token_id: u64) -> Result<Option<AccessRecord>, LedgerError> {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.check_network()?;
        Ok(self.state.lock().unwrap().records.get(&token_id).cloned())
    }

    async fn has_access(&self, owner: &str, node_id: &str) -> Result<bool, LedgerError> {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.check_network()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .grants
            .get(&(owner.to_string(), node_id.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn owner_of(&self, token_id: u64) -> Result<Option<String>, LedgerError> {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.check_network()?;
        Ok(self.state.lock().unwrap().owners.get(&token_id).cloned())
    }

    async fn mint_access(
        &self,
        _owner: &str,
        _node_id: &str,
        _public_key: &str,
        _token_uri: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        Err(LedgerError::SignerNotConfigured {
            operation: "mint_access".into(),
        })
    }

    async fn revoke_access(&self, _token_id: u64) -> Result<MutationReceipt, LedgerError> {
        Err(LedgerError::SignerNotConfigured {
            operation: "revoke_access".into(),
        })
    }

    async fn poll_events(&self, _cursor: u64) -> Result<EventPage, LedgerError> {
        self.check_network()?;
        let mut state = self.state.lock().unwrap();
        let events = std::mem::take(&mut state.pending_events);
        state.cursor += events.len() as u64;
        Ok(EventPage {
            events,
            cursor: state.cursor,
        })
    }

    fn has_signer(&self) -> bool {
        false
    }
}

/// Settings pointed at a temp directory, with fast intervals for tests.
pub fn test_settings(dir: &Path, node_id: &str) -> Settings {
    Settings {
        node_id: node_id.to_string(),
        ledger_rpc_url: "http://127.0.0.1:0".to_string(),
        contract_address: "0x0000000000000000000000000000000000000001".to_string(),
        signer_key: None,
        wg_private_key_path: dir.join("private.key"),
        wg_config_path: dir.join("wg0.conf"),
        wg_backup_dir: dir.join("backups"),
        wg_interface: "wg0".to_string(),
        listen_port: 51820,
        registry_path: dir.join("registry.json"),
        cache_ttl: Duration::from_secs(30),
        max_cache_size: 100,
        sync_interval: Duration::from_millis(200),
        event_poll_interval: Duration::from_millis(50),
        health_check_interval: Duration::from_secs(30),
        max_token_scan: 20,
        max_backups: 5,
        auto_restart: false,
        auto_sync: false,
    }
}
