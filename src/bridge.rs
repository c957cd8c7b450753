//! Orchestrator tying the gateway, verifier, registry sync and config
//! writer together into one daemon lifecycle.
//!
//! ```text
//!              +----------------+
//!   events --->| CallGateway    |<--- verify / scan
//!              +----------------+
//!                 |          |
//!        +--------v--+   +---v-----------+
//!        | Access    |   | RegistrySync  |
//!        | Verifier  |   +---------------+
//!        +-----------+          |
//!                        +------v--------+
//!                        | ConfigWriter  |
//!                        +---------------+
//! ```
//!
//! Ledger events invalidate both caches, then trigger a delayed registry
//! resync and a delayed config update so bursts coalesce.

use crate::access::{AccessVerdict, AccessVerifier, VerifierStats};
use crate::ledger::{
    CallGateway, GatewayStats, HttpLedger, LedgerError, LedgerRpc, RetryPolicy,
};
use crate::registry::{RegistryError, RegistryStore, RegistrySync, SyncOptions, SyncOutcome, SyncStats};
use crate::settings::Settings;
use crate::wgconfig::{
    build_config, ConfigError, ConfigWriter, ConfigWriterOptions, InterfaceStatus, WriterStats,
};
use crate::Health;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Delay between a ledger event and the config update it triggers. Longer
/// than the resync delay so the updated registry lands first.
const CONFIG_UPDATE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot read wireguard key at {path}: {source}")]
    PrivateKey {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub overall: Health,
    pub state: BridgeState,
    pub ledger: Health,
    pub registry: Health,
    pub config: Health,
    /// Live interface state as reported by `wg show`; informational only,
    /// not part of the aggregate.
    pub interface: InterfaceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub gateway: GatewayStats,
    pub verifier: VerifierStats,
    pub sync: SyncStats,
    pub writer: WriterStats,
}

pub struct Bridge {
    settings: Settings,
    gateway: Arc<CallGateway>,
    verifier: Arc<AccessVerifier>,
    sync: Arc<RegistrySync>,
    writer: Arc<ConfigWriter>,
    state: Mutex<BridgeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // One pending slot each; a new event replaces (and aborts) the previous
    // scheduled task so bursts coalesce and stop() can cancel them.
    pending_resync: Mutex<Option<JoinHandle<()>>>,
    pending_config: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Build a bridge talking to the ledger endpoint named in `settings`.
    pub fn new(settings: Settings) -> Result<Self, BridgeError> {
        let rpc = Arc::new(HttpLedger::new(
            settings.ledger_rpc_url.clone(),
            settings.contract_address.clone(),
            settings.signer_key.clone(),
        )?);
        Ok(Self::with_rpc(settings, rpc))
    }

    /// Build a bridge over an arbitrary ledger transport.
    pub fn with_rpc(settings: Settings, rpc: Arc<dyn LedgerRpc>) -> Self {
        let gateway = Arc::new(CallGateway::new(
            rpc,
            settings.cache_ttl,
            RetryPolicy::default(),
            settings.event_poll_interval,
        ));
        let verifier = Arc::new(AccessVerifier::new(
            Arc::clone(&gateway),
            settings.max_cache_size,
            settings.cache_ttl,
        ));
        let sync = Arc::new(RegistrySync::new(
            Arc::clone(&gateway),
            RegistryStore::new(settings.registry_path.clone()),
            settings.contract_address.clone(),
            SyncOptions {
                max_token_scan: settings.max_token_scan,
                sync_interval: settings.sync_interval,
                resync_delay: Duration::from_secs(5),
                auto_sync: settings.auto_sync,
            },
        ));
        let writer = Arc::new(ConfigWriter::new(ConfigWriterOptions {
            config_path: settings.wg_config_path.clone(),
            backup_dir: settings.wg_backup_dir.clone(),
            interface: settings.wg_interface.clone(),
            max_backups: settings.max_backups,
            auto_restart: settings.auto_restart,
        }));
        Self {
            settings,
            gateway,
            verifier,
            sync,
            writer,
            state: Mutex::new(BridgeState::Created),
            tasks: Mutex::new(Vec::new()),
            pending_resync: Mutex::new(None),
            pending_config: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// Bring the bridge up: initial registry sync, first config apply, then
    /// the background tasks (event pump, event coordinator, periodic sync,
    /// health reporter).
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        info!("starting bridge for node {}", self.settings.node_id);

        // Forced so startup never reports a skipped sync.
        let outcome = self.sync.force_sync().await;
        info!(
            "initial sync: {:?}, {} peers",
            outcome.status, outcome.peer_count
        );

        if let Err(e) = self.update_configuration().await {
            // The first apply routinely fails before the local node has a
            // token; the event coordinator retries once it appears.
            warn!("initial config apply deferred: {}", e);
        }

        let mut tasks = self.tasks.lock().unwrap();
        // Subscribe before the pump starts so no event slips past.
        tasks.push(self.spawn_event_coordinator(self.gateway.subscribe()));
        tasks.push(self.gateway.start_event_pump());
        if self.sync.options().auto_sync {
            tasks.push(self.sync.start_auto_sync());
        }
        tasks.push(self.spawn_health_reporter());
        drop(tasks);

        *self.state.lock().unwrap() = BridgeState::Running;
        info!("bridge is running");
        Ok(())
    }

    /// Stop all background tasks, including any event-scheduled resync or
    /// config update still pending. Idempotent.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(task) = self.pending_resync.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.pending_config.lock().unwrap().take() {
            task.abort();
        }
        *self.state.lock().unwrap() = BridgeState::Stopped;
        info!("bridge stopped");
    }

    /// Gate one inbound connection attempt.
    pub async fn handle_connection(&self, identity_key: &str, node_id: &str) -> AccessVerdict {
        self.verifier.verify(identity_key, node_id).await
    }

    /// Run a registry sync now. A forced sync runs even when another sync
    /// is already in flight; an unforced one returns `Skipped` instead.
    pub async fn sync_registry(&self, force: bool) -> SyncOutcome {
        if force {
            self.sync.force_sync().await
        } else {
            self.sync.sync().await
        }
    }

    /// Rebuild the tunnel config from the current registry and apply it.
    pub async fn update_configuration(&self) -> Result<(), BridgeError> {
        let private_key = std::fs::read_to_string(&self.settings.wg_private_key_path)
            .map_err(|source| BridgeError::PrivateKey {
                path: self.settings.wg_private_key_path.display().to_string(),
                source,
            })?;
        let registry = self.sync.registry();
        let config = build_config(
            &registry,
            &self.settings.node_id,
            private_key.trim(),
            self.settings.listen_port,
        )?;
        self.writer.update_config(&config).await?;
        Ok(())
    }

    fn spawn_event_coordinator(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<crate::ledger::LedgerEvent>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        info!(
                            "ledger event {} for token {}",
                            event.kind(),
                            event.token_id()
                        );
                        bridge.gateway.clear_cache();
                        bridge.verifier.clear_cache();
                        let resync = bridge.sync.schedule_resync();
                        if let Some(old) = bridge.pending_resync.lock().unwrap().replace(resync) {
                            old.abort();
                        }
                        let b = Arc::clone(&bridge);
                        let config_update = tokio::spawn(async move {
                            tokio::time::sleep(CONFIG_UPDATE_DELAY).await;
                            if let Err(e) = b.update_configuration().await {
                                warn!("event-driven config update failed: {}", e);
                            }
                        });
                        if let Some(old) =
                            bridge.pending_config.lock().unwrap().replace(config_update)
                        {
                            old.abort();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event coordinator lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_health_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.settings.health_check_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let health = bridge.health().await;
                if health.overall == Health::Healthy {
                    debug!("health: {}", health.overall);
                } else {
                    warn!(
                        "health: {} (ledger {}, registry {}, config {})",
                        health.overall, health.ledger, health.registry, health.config
                    );
                }
            }
        })
    }

    pub async fn health(&self) -> BridgeHealth {
        let ledger = self.gateway.health();
        let registry = self.sync.health();
        let config = self.writer.health();
        BridgeHealth {
            overall: Health::aggregate([ledger, registry, config]),
            state: self.state(),
            ledger,
            registry,
            config,
            interface: self.writer.interface_status().await,
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            gateway: self.gateway.stats(),
            verifier: self.verifier.stats(),
            sync: self.sync.stats(),
            writer: self.writer.stats(),
        }
    }
}
