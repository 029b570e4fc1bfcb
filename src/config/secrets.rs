//! File-backed secret store for the token state

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};

use super::{default_tokens_path, write_private, ConfigError};
use crate::auth::tokens::{fill_defaults, SecretStore, StoreChange, StoreError};

/// Token state kept in a TOML document next to the settings file.
///
/// Every `set` rewrites the whole document while holding the store lock and
/// swaps it in with a rename, so readers in this or another process never see
/// a partially applied update.
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            changes,
        }
    }

    /// Store at `<config dir>/tokens.toml`.
    pub fn default_location() -> Result<Self, ConfigError> {
        Ok(Self::new(default_tokens_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, StoreError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, defaults: Map<String, Value>) -> Result<Map<String, Value>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(fill_defaults(&self.load()?, defaults))
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let keys: Vec<String> = entries.keys().cloned().collect();

        let mut stored = self.load()?;
        stored.extend(entries);
        let content = toml::to_string(&stored).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_private(&self.path, &content).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::debug!("Token store updated ({} keys)", keys.len());
        let _ = self.changes.send(StoreChange { keys });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
