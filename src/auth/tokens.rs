//! Token storage and management

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const TOKEN_EXPIRES_AT_KEY: &str = "token_expires_at";
pub const ID_TOKEN_KEY: &str = "id_token";
pub const TOKEN_SCOPES_KEY: &str = "token_scopes";

const CHANGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Secret store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Secret store is corrupt: {0}")]
    Corrupt(String),
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// Keys written by a single [`SecretStore::set`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub keys: Vec<String>,
}

/// Persisted key-value store holding the token state.
///
/// `set` must apply all entries at once: a concurrent `get` observes either
/// none or all of them.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up every key of `defaults`, keeping the default for absent keys.
    async fn get(&self, defaults: Map<String, Value>) -> Result<Map<String, Value>, StoreError>;

    /// Merge `entries` into the store.
    async fn set(&self, entries: Map<String, Value>) -> Result<(), StoreError>;

    /// Notifications for every successful `set`.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// In-process store, for embedding and tests.
pub struct MemorySecretStore {
    entries: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(Map::new()),
            changes,
        }
    }

    /// Snapshot of everything stored.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, defaults: Map<String, Value>) -> Result<Map<String, Value>, StoreError> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(fill_defaults(&guard, defaults))
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        let keys = entries.keys().cloned().collect();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(entries);
        // No receivers is not an error
        let _ = self.changes.send(StoreChange { keys });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Resolve `defaults` against stored values.
pub fn fill_defaults(stored: &Map<String, Value>, defaults: Map<String, Value>) -> Map<String, Value> {
    defaults
        .into_iter()
        .map(|(key, default)| {
            let value = stored.get(&key).cloned().unwrap_or(default);
            (key, value)
        })
        .collect()
}

/// Cached credential state. Absent strings are empty, absent expiry is 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
    /// Epoch milliseconds.
    pub token_expires_at: i64,
    /// Normalized scope set the tokens were granted for.
    pub token_scopes: String,
}

impl TokenState {
    /// Usable access token that outlives `now_ms + margin_ms`.
    pub fn is_fresh(&self, now_ms: i64, margin_ms: i64) -> bool {
        !self.access_token.is_empty() && self.token_expires_at > now_ms + margin_ms
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    fn defaults() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(ACCESS_TOKEN_KEY.into(), Value::from(""));
        map.insert(REFRESH_TOKEN_KEY.into(), Value::from(""));
        map.insert(TOKEN_EXPIRES_AT_KEY.into(), Value::from(0));
        map.insert(ID_TOKEN_KEY.into(), Value::from(""));
        map.insert(TOKEN_SCOPES_KEY.into(), Value::from(""));
        map
    }

    fn from_entries(entries: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            entries
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            access_token: text(ACCESS_TOKEN_KEY),
            refresh_token: text(REFRESH_TOKEN_KEY),
            id_token: text(ID_TOKEN_KEY),
            token_expires_at: entries
                .get(TOKEN_EXPIRES_AT_KEY)
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            token_scopes: text(TOKEN_SCOPES_KEY),
        }
    }
}

/// Partial update of the token state; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub token_scopes: Option<String>,
}

impl TokenUpdate {
    /// Update that empties every token field but leaves the scope set alone.
    pub fn cleared() -> Self {
        Self {
            access_token: Some(String::new()),
            refresh_token: Some(String::new()),
            id_token: Some(String::new()),
            token_expires_at: Some(0),
            token_scopes: None,
        }
    }

    fn into_entries(self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(v) = self.access_token {
            map.insert(ACCESS_TOKEN_KEY.into(), Value::from(v));
        }
        if let Some(v) = self.refresh_token {
            map.insert(REFRESH_TOKEN_KEY.into(), Value::from(v));
        }
        if let Some(v) = self.id_token {
            map.insert(ID_TOKEN_KEY.into(), Value::from(v));
        }
        if let Some(v) = self.token_expires_at {
            map.insert(TOKEN_EXPIRES_AT_KEY.into(), Value::from(v));
        }
        if let Some(v) = self.token_scopes {
            map.insert(TOKEN_SCOPES_KEY.into(), Value::from(v));
        }
        map
    }
}

/// Token state view over a [`SecretStore`].
pub struct TokenCache {
    store: Arc<dyn SecretStore>,
    // Serializes read-compare-write sequences issued through this cache
    update_lock: tokio::sync::Mutex<()>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn read(&self) -> Result<TokenState, StoreError> {
        let entries = self.store.get(TokenState::defaults()).await?;
        Ok(TokenState::from_entries(&entries))
    }

    pub async fn write(&self, update: TokenUpdate) -> Result<(), StoreError> {
        let _guard = self.update_lock.lock().await;
        self.store.set(update.into_entries()).await
    }

    /// Clear the cached tokens if they were granted for a different scope set.
    ///
    /// Returns `true` when the cache was invalidated. The cleared tokens and
    /// the new scope set are written in one store update.
    pub async fn invalidate_if_scopes_changed(&self, requested: &str) -> Result<bool, StoreError> {
        let _guard = self.update_lock.lock().await;
        let current = self.read().await?;
        if current.token_scopes == requested {
            return Ok(false);
        }

        tracing::info!(
            "Requested scopes changed (cached: {:?}, requested: {:?}); clearing cached tokens",
            current.token_scopes,
            requested
        );
        let update = TokenUpdate {
            token_scopes: Some(requested.to_string()),
            ..TokenUpdate::cleared()
        };
        self.store.set(update.into_entries()).await?;
        Ok(true)
    }

    /// Forget every token; the scope set is kept for drift detection.
    pub async fn logout(&self) -> Result<(), StoreError> {
        self.write(TokenUpdate::cleared()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}
