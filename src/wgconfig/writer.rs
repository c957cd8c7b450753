use crate::wgconfig::render::TunnelConfig;
use crate::wgconfig::ConfigError;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::process::Command;

use crate::Health;

#[derive(Debug, Clone)]
pub struct ConfigWriterOptions {
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub interface: String,
    pub max_backups: usize,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub up: bool,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterStats {
    pub writes: u64,
    pub backups: u64,
    pub rollbacks: u64,
    pub restarts: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Applies tunnel configs to disk: backup, atomic replace, optional
/// interface restart, rollback on failure.
pub struct ConfigWriter {
    options: ConfigWriterOptions,
    writes: AtomicU64,
    backups: AtomicU64,
    rollbacks: AtomicU64,
    restarts: AtomicU64,
    consecutive_failures: AtomicU32,
    last_write: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl ConfigWriter {
    pub fn new(options: ConfigWriterOptions) -> Self {
        Self {
            options,
            writes: AtomicU64::new(0),
            backups: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_write: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.options.config_path
    }

    /// Validate, back up, write, and (optionally) restart. The existing
    /// config is untouched if validation fails; if applying the new config
    /// fails after the old one was replaced, the last backup is restored and
    /// the original error is reported.
    pub async fn update_config(&self, config: &TunnelConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.ensure_dirs()?;

        let backed_up = self.create_backup()?.is_some();

        let result = self.apply(config).await;
        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_write.lock().unwrap() = Some(Utc::now());
                *self.last_error.lock().unwrap() = None;
                info!(
                    "applied config with {} peers to {}",
                    config.peers.len(),
                    self.options.config_path.display()
                );
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock().unwrap() = Some(e.to_string());
                if backed_up {
                    // The original error stays the one reported, whether or
                    // not the rollback goes through.
                    match self.rollback().await {
                        Ok(path) => {
                            warn!("rolled back config from {}", path.display());
                        }
                        Err(rollback_err) => {
                            error!("rollback failed: {}", rollback_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, config: &TunnelConfig) -> Result<(), ConfigError> {
        self.write_atomic(&config.render())?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.options.auto_restart {
            self.restart_interface().await?;
        }
        Ok(())
    }

    fn ensure_dirs(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.options.config_path.parent() {
            std::fs::create_dir_all(parent)?;
            restrict_dir(parent)?;
        }
        std::fs::create_dir_all(&self.options.backup_dir)?;
        restrict_dir(&self.options.backup_dir)?;
        Ok(())
    }

    /// Copy the current config into the backup directory, then prune old
    /// backups down to `max_backups` by modification time. Returns `None`
    /// when there is no config to back up yet.
    pub fn create_backup(&self) -> Result<Option<PathBuf>, ConfigError> {
        if !self.options.config_path.exists() {
            return Ok(None);
        }
        // Colons are not filesystem-friendly; dashes throughout.
        let name = format!(
            "{}-{}.conf",
            self.options.interface,
            Utc::now().format("%Y-%m-%dT%H-%M-%S-%3f")
        );
        let backup_path = self.options.backup_dir.join(name);
        std::fs::copy(&self.options.config_path, &backup_path)?;
        restrict_file(&backup_path)?;
        self.backups.fetch_add(1, Ordering::Relaxed);
        self.prune_backups()?;
        Ok(Some(backup_path))
    }

    fn backup_files(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>, ConfigError> {
        let mut backups = Vec::new();
        let prefix = format!("{}-", self.options.interface);
        for entry in std::fs::read_dir(&self.options.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".conf") {
                let modified = entry.metadata()?.modified()?;
                backups.push((entry.path(), modified));
            }
        }
        backups.sort_by_key(|(_, modified)| *modified);
        Ok(backups)
    }

    fn prune_backups(&self) -> Result<(), ConfigError> {
        let backups = self.backup_files()?;
        if backups.len() <= self.options.max_backups {
            return Ok(());
        }
        let excess = backups.len() - self.options.max_backups;
        for (path, _) in backups.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("could not prune backup {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn write_atomic(&self, contents: &str) -> Result<(), ConfigError> {
        let tmp = self.options.config_path.with_extension("conf.tmp");
        std::fs::write(&tmp, contents)?;
        restrict_file(&tmp)?;
        std::fs::rename(&tmp, &self.options.config_path)?;
        Ok(())
    }

    /// Bounce the interface with wg-quick. A failed `down` is expected when
    /// the interface is not up yet; a failed `up` is the real error.
    pub async fn restart_interface(&self) -> Result<(), ConfigError> {
        let down = Command::new("wg-quick")
            .args(["down", &self.options.interface])
            .output()
            .await;
        match down {
            Ok(output) if !output.status.success() => {
                warn!(
                    "wg-quick down {} exited with {}",
                    self.options.interface, output.status
                );
            }
            Err(e) => {
                warn!("wg-quick down {} failed: {}", self.options.interface, e);
            }
            Ok(_) => {}
        }

        let up = Command::new("wg-quick")
            .args(["up", &self.options.interface])
            .output()
            .await
            .map_err(|e| ConfigError::Restart(e.to_string()))?;
        if !up.status.success() {
            return Err(ConfigError::Restart(format!(
                "wg-quick up {} exited with {}: {}",
                self.options.interface,
                up.status,
                String::from_utf8_lossy(&up.stderr).trim()
            )));
        }
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Restore the newest backup over the live config and, when auto-restart
    /// is enabled, bounce the interface onto the restored configuration.
    pub async fn rollback(&self) -> Result<PathBuf, ConfigError> {
        let newest = self
            .backup_files()?
            .pop()
            .map(|(path, _)| path)
            .ok_or(ConfigError::NoBackup)?;
        let contents = std::fs::read_to_string(&newest)?;
        self.write_atomic(&contents)?;
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        if self.options.auto_restart {
            self.restart_interface().await?;
        }
        Ok(newest)
    }

    /// Query the live interface with `wg show`.
    pub async fn interface_status(&self) -> InterfaceStatus {
        let output = Command::new("wg")
            .args(["show", &self.options.interface])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                let peer_count = text
                    .lines()
                    .filter(|line| line.trim_start().starts_with("peer:"))
                    .count();
                InterfaceStatus {
                    up: true,
                    peer_count,
                }
            }
            _ => InterfaceStatus {
                up: false,
                peer_count: 0,
            },
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            writes: self.writes.load(Ordering::Relaxed),
            backups: self.backups.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_write: *self.last_write.lock().unwrap(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }

    pub fn health(&self) -> Health {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => Health::Healthy,
            1..=2 => Health::Degraded,
            _ => Health::Unhealthy,
        }
    }
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Peer, Registry};
    use crate::wgconfig::render::build_config;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::time::Duration;

    fn key(fill: u8) -> String {
        STANDARD.encode([fill; 32])
    }

    fn registry() -> Registry {
        let mut registry = Registry::default();
        for (i, node_id) in ["alpha", "beta"].iter().enumerate() {
            registry.peers.push(Peer {
                node_id: node_id.to_string(),
                public_key: key(i as u8 + 1),
                ip_address: format!("10.0.0.{}", i + 2),
                hostname: format!("{node_id}.vpn.mesh"),
                owner_address: "0x1".to_string(),
                token_id: i as u64 + 1,
                active: true,
                created_at: Utc::now(),
            });
        }
        registry
    }

    fn writer(dir: &tempfile::TempDir, auto_restart: bool) -> ConfigWriter {
        ConfigWriter::new(ConfigWriterOptions {
            config_path: dir.path().join("wg0.conf"),
            backup_dir: dir.path().join("backups"),
            interface: "wg0".to_string(),
            max_backups: 3,
            auto_restart,
        })
    }

    #[tokio::test]
    async fn update_writes_rendered_config() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(&dir, false);
        let config = build_config(&registry(), "alpha", &key(9), 51820).unwrap();

        w.update_config(&config).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(text.contains("[Interface]"));
        assert!(text.contains("# beta"));
        assert!(!dir.path().join("wg0.conf.tmp").exists());
        assert_eq!(w.stats().writes, 1);
        assert_eq!(w.health(), Health::Healthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn config_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let w = writer(&dir, false);
        let config = build_config(&registry(), "alpha", &key(9), 51820).unwrap();
        w.update_config(&config).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("wg0.conf"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn invalid_config_leaves_existing_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wg0.conf"), "old contents").unwrap();
        let w = writer(&dir, false);

        let mut config = build_config(&registry(), "alpha", &key(9), 51820).unwrap();
        config.interface.private_key = String::new();
        assert!(w.update_config(&config).await.is_err());

        let text = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(text, "old contents");
        assert_eq!(w.stats().backups, 0);
    }

    #[tokio::test]
    async fn backups_rotate_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(&dir, false);
        let config = build_config(&registry(), "alpha", &key(9), 51820).unwrap();

        for _ in 0..5 {
            w.update_config(&config).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // First write had nothing to back up; 4 backups made, pruned to 3.
        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(backups.len(), 3);
        // Names carry a date-stamped suffix, e.g. wg0-2026-08-29T12-30-45-123.conf
        let prefix = format!("wg0-{}", Utc::now().format("%Y-"));
        assert!(backups.iter().all(|n| n.starts_with(&prefix)));
        assert!(backups.iter().all(|n| n.ends_with(".conf")));
    }

    #[tokio::test]
    async fn failed_restart_rolls_back_and_reports_original_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wg0.conf"), "previous config").unwrap();
        // wg-quick is not installed in the test environment, so the restart
        // step fails after the file was replaced.
        let w = writer(&dir, true);
        let config = build_config(&registry(), "alpha", &key(9), 51820).unwrap();

        let err = w.update_config(&config).await.unwrap_err();
        assert!(matches!(err, ConfigError::Restart(_)));

        let text = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(text, "previous config");
        assert_eq!(w.stats().rollbacks, 1);
        assert_eq!(w.health(), Health::Degraded);
    }

    #[tokio::test]
    async fn rollback_without_backup_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(&dir, false);
        w.ensure_dirs().unwrap();
        assert!(matches!(w.rollback().await, Err(ConfigError::NoBackup)));
    }

    #[tokio::test]
    async fn rollback_restarts_the_interface_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(&dir, true);
        std::fs::write(dir.path().join("wg0.conf"), "good config").unwrap();
        w.ensure_dirs().unwrap();
        w.create_backup().unwrap();
        std::fs::write(dir.path().join("wg0.conf"), "broken config").unwrap();

        // wg-quick is unavailable here, so the post-restore restart fails;
        // the file must still be restored first.
        let err = w.rollback().await.unwrap_err();
        assert!(matches!(err, ConfigError::Restart(_)));
        let text = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(text, "good config");
        assert_eq!(w.stats().rollbacks, 1);
    }
}
