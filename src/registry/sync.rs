//! Ledger-to-registry synchronization. A sync walks the token range,
//! rebuilds the peer set from whatever the ledger reports, and replaces the
//! local registry wholesale before persisting it.

use crate::ledger::{CallGateway, LedgerError};
use crate::registry::store::RegistryStore;
use crate::registry::types::{Peer, Registry, REGISTRY_VERSION};
use crate::registry::RegistryError;
use crate::validate;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::Health;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Highest token id checked during a scan.
    pub max_token_scan: u64,
    pub sync_interval: Duration,
    /// Delay before a sync triggered by a ledger event.
    pub resync_delay: Duration,
    pub auto_sync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_token_scan: 1000,
            sync_interval: Duration::from_secs(60),
            resync_delay: Duration::from_secs(5),
            auto_sync: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    /// Another sync was already running.
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub peer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub syncs_completed: u64,
    pub consecutive_errors: u32,
    pub address_collisions: u64,
    pub peer_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct RegistrySync {
    gateway: Arc<CallGateway>,
    store: RegistryStore,
    registry: RwLock<Registry>,
    contract_address: String,
    options: SyncOptions,
    sync_in_progress: AtomicBool,
    syncs_completed: AtomicU64,
    consecutive_errors: AtomicU32,
    address_collisions: AtomicU64,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl RegistrySync {
    pub fn new(
        gateway: Arc<CallGateway>,
        store: RegistryStore,
        contract_address: String,
        options: SyncOptions,
    ) -> Self {
        let registry = store.load();
        Self {
            gateway,
            store,
            registry: RwLock::new(registry),
            contract_address,
            options,
            sync_in_progress: AtomicBool::new(false),
            syncs_completed: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            address_collisions: AtomicU64::new(0),
            last_sync: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Current registry contents. Snapshot semantics; a concurrent sync
    /// replaces the registry as a whole, never in place.
    pub fn registry(&self) -> Registry {
        self.registry.read().unwrap().clone()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one synchronization. At most one sync runs at a time; a caller
    /// arriving while another is in flight gets `Skipped` without touching
    /// the in-progress flag.
    pub async fn sync(&self) -> SyncOutcome {
        self.sync_with(false).await
    }

    /// Run a synchronization even when one is already in flight.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.sync_with(true).await
    }

    async fn sync_with(&self, force: bool) -> SyncOutcome {
        if self.sync_in_progress.swap(true, Ordering::SeqCst) && !force {
            debug!("sync already in progress, skipping");
            return SyncOutcome {
                status: SyncStatus::Skipped,
                peer_count: self.registry.read().unwrap().peers.len(),
                error: None,
            };
        }

        let outcome = self.sync_inner().await;
        self.sync_in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn sync_inner(&self) -> SyncOutcome {
        info!("starting registry sync");
        match self.scan_ledger().await {
            Ok(peers) => {
                let peer_count = peers.len();
                let registry = Registry {
                    version: REGISTRY_VERSION.to_string(),
                    contract_address: self.contract_address.clone(),
                    network: self.registry.read().unwrap().network.clone(),
                    last_sync: Utc::now(),
                    peers,
                };
                if let Err(e) = self.store.save(&registry) {
                    warn!("failed to persist registry: {}", e);
                }
                *self.registry.write().unwrap() = registry;
                self.syncs_completed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_errors.store(0, Ordering::Relaxed);
                *self.last_sync.lock().unwrap() = Some(Utc::now());
                *self.last_error.lock().unwrap() = None;
                info!("registry sync complete: {} peers", peer_count);
                SyncOutcome {
                    status: SyncStatus::Success,
                    peer_count,
                    error: None,
                }
            }
            Err(e) => {
                // The previous registry stays in force.
                warn!("registry sync failed: {}", e);
                self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock().unwrap() = Some(e.to_string());
                SyncOutcome {
                    status: SyncStatus::Error,
                    peer_count: self.registry.read().unwrap().peers.len(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Walk every token id in range and build the peer list. A network
    /// outage aborts the whole scan; any other per-token failure skips just
    /// that token.
    async fn scan_ledger(&self) -> Result<Vec<Peer>, RegistryError> {
        let mut peers: Vec<Peer> = Vec::new();
        let mut occupied: HashSet<String> = HashSet::new();

        for token_id in 1..=self.options.max_token_scan {
            let record = match self.gateway.access_record(token_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e @ LedgerError::NetworkUnavailable(_)) => return Err(e.into()),
                Err(e) => {
                    debug!("skipping token {}: {}", token_id, e);
                    continue;
                }
            };

            if !record.is_active {
                continue;
            }
            if validate::node_id(&record.node_id).is_err()
                || validate::public_key(&record.public_key).is_err()
            {
                warn!("skipping token {}: malformed record", token_id);
                continue;
            }

            let owner = match self.gateway.owner_of(token_id).await {
                Ok(Some(owner)) => owner,
                Ok(None) => continue,
                Err(e @ LedgerError::NetworkUnavailable(_)) => return Err(e.into()),
                Err(e) => {
                    debug!("skipping token {}: {}", token_id, e);
                    continue;
                }
            };
            if validate::owner_address(&owner).is_err() {
                warn!("skipping token {}: malformed owner address", token_id);
                continue;
            }

            let preferred = deterministic_address(token_id);
            let ip_address = if occupied.contains(&preferred) {
                self.address_collisions.fetch_add(1, Ordering::Relaxed);
                let fallback = assign_address(&occupied).ok_or_else(|| {
                    warn!("overlay subnet exhausted at token {}", token_id);
                    RegistryError::NoAddressAvailable
                });
                match fallback {
                    Ok(addr) => {
                        warn!(
                            "address collision for token {}: {} taken, assigned {}",
                            token_id, preferred, addr
                        );
                        addr
                    }
                    // Subnet full: keep what we have rather than failing
                    // the whole sync.
                    Err(_) => {
                        warn!("dropping token {}: no address available", token_id);
                        continue;
                    }
                }
            } else {
                preferred
            };
            occupied.insert(ip_address.clone());

            let created_at = DateTime::from_timestamp(record.created_at as i64, 0)
                .unwrap_or_else(Utc::now);
            peers.push(Peer {
                hostname: format!("{}.vpn.mesh", record.node_id),
                node_id: record.node_id,
                public_key: record.public_key,
                ip_address,
                owner_address: owner,
                token_id,
                active: true,
                created_at,
            });
        }

        Ok(peers)
    }

    /// Periodic sync loop. The first sync runs immediately.
    pub fn start_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync.options.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sync.sync().await;
            }
        })
    }

    /// Deferred sync after a ledger event, batching bursts of events into
    /// one scan.
    pub fn schedule_resync(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(sync.options.resync_delay).await;
            sync.sync().await;
        })
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            syncs_completed: self.syncs_completed.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            address_collisions: self.address_collisions.load(Ordering::Relaxed),
            peer_count: self.registry.read().unwrap().peers.len(),
            last_sync: *self.last_sync.lock().unwrap(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }

    pub fn health(&self) -> Health {
        match self.consecutive_errors.load(Ordering::Relaxed) {
            0 => Health::Healthy,
            1..=2 => Health::Degraded,
            _ => Health::Unhealthy,
        }
    }
}

/// Stable address for a token: `10.0.0.(1 + token_id % 254)`.
pub fn deterministic_address(token_id: u64) -> String {
    format!("10.0.0.{}", 1 + (token_id % 254))
}

/// Lowest free host address in the /24, or `None` when all 254 are taken.
pub fn assign_address(occupied: &HashSet<String>) -> Option<String> {
    (1..=254u32)
        .map(|host| format!("10.0.0.{host}"))
        .find(|addr| !occupied.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::rpc::LedgerRpc;
    use crate::ledger::types::{AccessRecord, EventPage, MutationReceipt};
    use crate::ledger::RetryPolicy;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::collections::HashMap;

    fn key(fill: u8) -> String {
        STANDARD.encode([fill; 32])
    }

    struct FakeLedger {
        records: HashMap<u64, AccessRecord>,
        owners: HashMap<u64, String>,
        fail_token: Option<u64>,
        network_down: bool,
        delay: Option<Duration>,
    }

    impl FakeLedger {
        fn new() -> Self {
            Self {
                records: HashMap::new(),
                owners: HashMap::new(),
                fail_token: None,
                network_down: false,
                delay: None,
            }
        }

        fn with_token(mut self, token_id: u64, node_id: &str, active: bool) -> Self {
            self.records.insert(
                token_id,
                AccessRecord {
                    node_id: node_id.to_string(),
                    public_key: key(token_id as u8),
                    created_at: 1_700_000_000,
                    is_active: active,
                },
            );
            self.owners
                .insert(token_id, format!("{:040x}", token_id));
            self
        }
    }

    #[async_trait]
    impl LedgerRpc for FakeLedger {
        async fn token_id_for_node(&self, _node_id: &str) -> Result<u64, LedgerError> {
            Ok(0)
        }

        async fn access_record(&self, token_id: u64) -> Result<Option<AccessRecord>, LedgerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.network_down {
                return Err(LedgerError::NetworkUnavailable("down".into()));
            }
            if self.fail_token == Some(token_id) {
                return Err(LedgerError::CallFailed {
                    operation: "getRecord".into(),
                    message: "revert".into(),
                });
            }
            Ok(self.records.get(&token_id).cloned())
        }

        async fn has_access(&self, _owner: &str, _node_id: &str) -> Result<bool, LedgerError> {
            Ok(true)
        }

        async fn owner_of(&self, token_id: u64) -> Result<Option<String>, LedgerError> {
            Ok(self.owners.get(&token_id).cloned())
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

        async fn poll_events(&self, cursor: u64) -> Result<EventPage, LedgerError> {
            Ok(EventPage {
                events: vec![],
                cursor,
            })
        }

        fn has_signer(&self) -> bool {
            false
        }
    }

    fn sync_over(ledger: FakeLedger, dir: &tempfile::TempDir, max_scan: u64) -> RegistrySync {
        let gateway = Arc::new(CallGateway::new(
            Arc::new(ledger),
            Duration::from_secs(30),
            RetryPolicy::default(),
            Duration::from_secs(10),
        ));
        RegistrySync::new(
            gateway,
            RegistryStore::new(dir.path().join("registry.json")),
            "0x00000000000000000000000000000000000000aa".to_string(),
            SyncOptions {
                max_token_scan: max_scan,
                ..SyncOptions::default()
            },
        )
    }

    #[test]
    fn addresses_are_deterministic_and_wrap() {
        assert_eq!(deterministic_address(1), "10.0.0.2");
        assert_eq!(deterministic_address(253), "10.0.0.254");
        assert_eq!(deterministic_address(254), "10.0.0.1");
        assert_eq!(deterministic_address(255), "10.0.0.2");
    }

    #[test]
    fn assign_address_picks_lowest_free() {
        let mut occupied = HashSet::new();
        occupied.insert("10.0.0.1".to_string());
        occupied.insert("10.0.0.2".to_string());
        assert_eq!(assign_address(&occupied), Some("10.0.0.3".to_string()));

        for host in 1..=254u32 {
            occupied.insert(format!("10.0.0.{host}"));
        }
        assert_eq!(assign_address(&occupied), None);
    }

    #[tokio::test]
    async fn sync_builds_registry_from_active_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FakeLedger::new()
            .with_token(1, "alpha", true)
            .with_token(2, "beta", false)
            .with_token(5, "gamma", true);
        let sync = sync_over(ledger, &dir, 10);

        let outcome = sync.sync().await;
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.peer_count, 2);

        let registry = sync.registry();
        let alpha = registry.peer_by_node_id("alpha").unwrap();
        assert_eq!(alpha.ip_address, "10.0.0.2");
        assert_eq!(alpha.hostname, "alpha.vpn.mesh");
        assert!(registry.peer_by_node_id("beta").is_none());
        // Persisted too.
        assert!(dir.path().join("registry.json").exists());
    }

    #[tokio::test]
    async fn per_token_failure_skips_only_that_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FakeLedger::new()
            .with_token(1, "alpha", true)
            .with_token(2, "beta", true);
        ledger.fail_token = Some(1);
        let sync = sync_over(ledger, &dir, 5);

        let outcome = sync.sync().await;
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.peer_count, 1);
        assert!(sync.registry().peer_by_node_id("beta").is_some());
    }

    #[tokio::test]
    async fn network_outage_keeps_previous_registry() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_over(FakeLedger::new().with_token(1, "alpha", true), &dir, 5);
        assert_eq!(sync.sync().await.status, SyncStatus::Success);

        let mut down = FakeLedger::new();
        down.network_down = true;
        let broken = sync_over(down, &dir, 5);
        // The store seeded from the previous run survives the failed scan.
        assert_eq!(broken.registry().peers.len(), 1);
        let outcome = broken.sync().await;
        assert_eq!(outcome.status, SyncStatus::Error);
        assert_eq!(broken.registry().peers.len(), 1);
        assert_eq!(broken.health(), Health::Degraded);
    }

    #[tokio::test]
    async fn concurrent_sync_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FakeLedger::new().with_token(1, "alpha", true);
        ledger.delay = Some(Duration::from_millis(5));
        let sync = Arc::new(sync_over(ledger, &dir, 3));

        let first = Arc::clone(&sync);
        let second = Arc::clone(&sync);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.sync().await }),
            async move {
                // Let the first sync reach its first ledger call.
                tokio::time::sleep(Duration::from_millis(1)).await;
                second.sync().await
            }
        );
        assert_eq!(a.unwrap().status, SyncStatus::Success);
        assert_eq!(b.status, SyncStatus::Skipped);
        assert_eq!(sync.stats().syncs_completed, 1);
    }

    #[tokio::test]
    async fn forced_sync_overrides_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FakeLedger::new().with_token(1, "alpha", true);
        ledger.delay = Some(Duration::from_millis(5));
        let sync = Arc::new(sync_over(ledger, &dir, 3));

        let first = Arc::clone(&sync);
        let second = Arc::clone(&sync);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.sync().await }),
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                second.force_sync().await
            }
        );
        // The forced caller runs a full cycle instead of being skipped.
        assert_eq!(a.unwrap().status, SyncStatus::Success);
        assert_eq!(b.status, SyncStatus::Success);
        assert_eq!(sync.stats().syncs_completed, 2);
    }

    #[tokio::test]
    async fn colliding_tokens_get_fallback_addresses() {
        let dir = tempfile::tempdir().unwrap();
        // Tokens 1 and 255 both map to 10.0.0.2.
        let ledger = FakeLedger::new()
            .with_token(1, "alpha", true)
            .with_token(255, "omega", true);
        let sync = sync_over(ledger, &dir, 255);

        let outcome = sync.sync().await;
        assert_eq!(outcome.status, SyncStatus::Success);
        let registry = sync.registry();
        assert_eq!(
            registry.peer_by_node_id("alpha").unwrap().ip_address,
            "10.0.0.2"
        );
        // First free host address.
        assert_eq!(
            registry.peer_by_node_id("omega").unwrap().ip_address,
            "10.0.0.1"
        );
        assert_eq!(sync.stats().address_collisions, 1);
    }
}
