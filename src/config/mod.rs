//! Configuration and credential storage

mod secrets;

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use secrets::FileSecretStore;

/// Sentinel shipped in place of a real application (client) ID.
pub const APPLICATION_ID_PLACEHOLDER: &str = "REPLACE_WITH_APPLICATION_ID";
pub const DEFAULT_TENANT: &str = "organizations";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:53682/callback";

const SETTINGS_FILE: &str = "config.toml";
const TOKENS_FILE: &str = "tokens.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Which kind of Microsoft account the user signs in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    #[default]
    Work,
    Personal,
}

impl AccountMode {
    /// Tenant to sign in against when none is configured explicitly.
    pub fn default_tenant(self) -> &'static str {
        match self {
            AccountMode::Work => DEFAULT_TENANT,
            AccountMode::Personal => "consumers",
        }
    }
}

/// What the caller creates with the token, which decides the scopes requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingMode {
    /// Standalone online meeting (`/me/onlineMeetings`)
    #[default]
    Direct,
    /// Calendar event with a Teams meeting attached (`/me/events`)
    Calendar,
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountMode::Work => "work",
            AccountMode::Personal => "personal",
        })
    }
}

impl fmt::Display for MeetingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MeetingMode::Direct => "direct",
            MeetingMode::Calendar => "calendar",
        })
    }
}

impl FromStr for AccountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "work" => Ok(AccountMode::Work),
            "personal" => Ok(AccountMode::Personal),
            other => Err(format!("unknown account mode '{}' (expected work or personal)", other)),
        }
    }
}

impl FromStr for MeetingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(MeetingMode::Direct),
            "calendar" => Ok(MeetingMode::Calendar),
            other => Err(format!("unknown meeting mode '{}' (expected direct or calendar)", other)),
        }
    }
}

/// User settings. Missing keys in the settings file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application (client) ID registered with the identity platform
    pub client_id: String,
    /// GUID, verified domain, or organizations/common/consumers
    pub tenant: String,
    /// Login endpoint, e.g. https://login.microsoftonline.com
    pub authority_host: String,
    /// Space separated scopes; empty means the meeting mode's defaults
    pub scopes: String,
    pub account_mode: AccountMode,
    pub meeting_mode: MeetingMode,
    pub debug_enabled: bool,
    /// Silence the warning for authority hosts outside the known clouds
    pub allow_custom_authority_host: bool,
    /// Loopback redirect URI registered for the application
    pub redirect_uri: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: APPLICATION_ID_PLACEHOLDER.to_string(),
            tenant: DEFAULT_TENANT.to_string(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            scopes: String::new(),
            account_mode: AccountMode::default(),
            meeting_mode: MeetingMode::default(),
            debug_enabled: false,
            allow_custom_authority_host: false,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

impl Settings {
    /// Whether a real client id has been filled in.
    pub fn is_configured(&self) -> bool {
        !is_placeholder(&self.client_id)
    }
}

pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == APPLICATION_ID_PLACEHOLDER
}

/// Source of the settings snapshot used for each token operation.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self) -> Result<Settings, ConfigError>;

    /// Point the user at configuration; called when no client id is set.
    fn request_configuration(&self) {}
}

/// A fixed settings snapshot.
#[async_trait]
impl SettingsProvider for Settings {
    async fn get(&self) -> Result<Settings, ConfigError> {
        Ok(self.clone())
    }
}

/// Settings stored as TOML in the platform config directory.
#[derive(Debug, Clone)]
pub struct FileSettingsProvider {
    path: PathBuf,
}

impl FileSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Provider for `<config dir>/config.toml`.
    pub fn default_location() -> Result<Self, ConfigError> {
        Ok(Self::new(config_dir()?.join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings from disk
    pub fn load(&self) -> Result<Settings, ConfigError> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Save settings to disk
    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(settings)?;
        write_private(&self.path, &content)
    }
}

#[async_trait]
impl SettingsProvider for FileSettingsProvider {
    async fn get(&self) -> Result<Settings, ConfigError> {
        self.load()
    }

    fn request_configuration(&self) {
        tracing::warn!(
            "No application ID configured. Set client_id in {} or run 'teams-meeting configure --client-id <ID>'.",
            self.path.display()
        );
    }
}

/// Get config directory path
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let proj_dirs =
        ProjectDirs::from("com", "teams-meeting", "teams-meeting").ok_or(ConfigError::NoConfigDir)?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Default location of the token file.
pub fn default_tokens_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(TOKENS_FILE))
}

/// Write `content` to `path`, creating parent directories, readable by the
/// owner only on unix.
///
/// The document is staged in a sibling file and renamed over `path`, so a
/// reader in another process sees the old or the new content, never a
/// truncated file.
pub(crate) fn write_private(path: &Path, content: &str) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(write_err)?;
    }

    let staging = staging_path(path);
    let written = create_private(&staging, content.as_bytes()).and_then(|()| fs::rename(&staging, path));
    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    written.map_err(write_err)
}

/// `.<name>.<pid>.<n>.tmp` next to `path`; unique per process and call.
fn staging_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
}

/// Create a new file with owner-only permissions from the start.
fn create_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
