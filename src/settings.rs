//! Environment-driven configuration for the bridge daemon.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Runtime settings, sourced from the environment.
#[derive(Clone)]
pub struct Settings {
    pub node_id: String,
    pub ledger_rpc_url: String,
    pub contract_address: String,
    /// Ledger signing key for mutations. Optional; read-only deployments
    /// leave it unset.
    pub signer_key: Option<String>,
    pub wg_private_key_path: PathBuf,
    pub wg_config_path: PathBuf,
    pub wg_backup_dir: PathBuf,
    pub wg_interface: String,
    pub listen_port: u16,
    pub registry_path: PathBuf,
    pub cache_ttl: Duration,
    pub max_cache_size: usize,
    pub sync_interval: Duration,
    pub event_poll_interval: Duration,
    pub health_check_interval: Duration,
    pub max_token_scan: u64,
    pub max_backups: usize,
    pub auto_restart: bool,
    pub auto_sync: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Ok(Self {
            node_id: require("NODE_ID")?,
            ledger_rpc_url: require("LEDGER_RPC_URL")?,
            contract_address: require("CONTRACT_ADDRESS")?,
            signer_key: optional("SIGNER_KEY"),
            wg_private_key_path: path_var("WG_PRIVATE_KEY_PATH", "/etc/wireguard/private.key"),
            wg_config_path: path_var("WG_CONFIG_PATH", "/etc/wireguard/wg0.conf"),
            wg_backup_dir: path_var("WG_BACKUP_DIR", "/etc/wireguard/backups"),
            wg_interface: optional("WG_INTERFACE").unwrap_or_else(|| "wg0".to_string()),
            listen_port: parsed("LISTEN_PORT", 51820)?,
            registry_path: path_var("REGISTRY_PATH", "/var/lib/wgbridge/registry.json"),
            cache_ttl: Duration::from_secs(parsed("CACHE_TTL_SECS", 30)?),
            max_cache_size: parsed("MAX_CACHE_SIZE", 1000)?,
            sync_interval: Duration::from_secs(parsed("SYNC_INTERVAL_SECS", 60)?),
            event_poll_interval: Duration::from_secs(parsed("EVENT_POLL_INTERVAL_SECS", 10)?),
            health_check_interval: Duration::from_secs(parsed("HEALTH_CHECK_INTERVAL_SECS", 30)?),
            max_token_scan: parsed("MAX_TOKEN_SCAN", 1000)?,
            max_backups: parsed("MAX_BACKUPS", 10)?,
            auto_restart: flag("AUTO_RESTART", true)?,
            auto_sync: flag("AUTO_SYNC", true)?,
        })
    }
}

// The signing key never appears in logs.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("node_id", &self.node_id)
            .field("ledger_rpc_url", &self.ledger_rpc_url)
            .field("contract_address", &self.contract_address)
            .field("signer_key", &self.signer_key.as_ref().map(|_| "<redacted>"))
            .field("wg_private_key_path", &self.wg_private_key_path)
            .field("wg_config_path", &self.wg_config_path)
            .field("wg_backup_dir", &self.wg_backup_dir)
            .field("wg_interface", &self.wg_interface)
            .field("listen_port", &self.listen_port)
            .field("registry_path", &self.registry_path)
            .field("cache_ttl", &self.cache_ttl)
            .field("max_cache_size", &self.max_cache_size)
            .field("sync_interval", &self.sync_interval)
            .field("event_poll_interval", &self.event_poll_interval)
            .field("health_check_interval", &self.health_check_interval)
            .field("max_token_scan", &self.max_token_scan)
            .field("max_backups", &self.max_backups)
            .field("auto_restart", &self.auto_restart)
            .field("auto_sync", &self.auto_sync)
            .finish()
    }
}

fn optional(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn require(var: &'static str) -> Result<String, SettingsError> {
    optional(var).ok_or(SettingsError::Missing(var))
}

fn path_var(var: &'static str, default: &str) -> PathBuf {
    optional(var).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, SettingsError>
where
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| SettingsError::Invalid {
            var,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn flag(var: &'static str, default: bool) -> Result<bool, SettingsError> {
    match optional(var) {
        Some(raw) => parse_flag(&raw).ok_or_else(|| SettingsError::Invalid {
            var,
            message: format!("expected a boolean, got {raw}"),
        }),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
