use crate::registry::types::Registry;
use crate::registry::RegistryError;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// On-disk registry persistence. Writes go through a sibling temp file and a
/// rename so readers never observe a half-written registry.
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, falling back to a fresh one when the file is
    /// missing, unreadable, or structurally invalid.
    pub fn load(&self) -> Registry {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Registry>(&contents) {
                Ok(registry) if registry.is_valid() => {
                    info!(
                        "loaded registry with {} peers from {}",
                        registry.peers.len(),
                        self.path.display()
                    );
                    registry
                }
                Ok(_) => {
                    warn!(
                        "registry at {} failed validation, starting fresh",
                        self.path.display()
                    );
                    Registry::default()
                }
                Err(e) => {
                    warn!(
                        "registry at {} is unparseable ({}), starting fresh",
                        self.path.display(),
                        e
                    );
                    Registry::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Registry::default(),
            Err(e) => {
                warn!("cannot read {}: {}, starting fresh", self.path.display(), e);
                Registry::default()
            }
        }
    }

    pub fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(registry)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
