//! Settings Storage
//!
//! Reads and writes `settings.json`.
//! Location: ~/.oxide-remote on macOS/Linux, %APPDATA%\OxideRemote on Windows

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::ssh::{ConnectionConfig, ConnectionPoolConfig};

/// Current settings file version
pub const SETTINGS_VERSION: u32 = 1;

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Defaults applied to every connection built from the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default)]
    pub auto_trust_unknown_host: bool,

    #[serde(default)]
    pub allow_insecure_host_key: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            known_hosts_path: None,
            auto_trust_unknown_host: false,
            allow_insecure_host_key: false,
        }
    }
}

/// Contents of settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub pool: ConnectionPoolConfig,

    #[serde(default)]
    pub connection: ConnectionDefaults,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            pool: ConnectionPoolConfig::default(),
            connection: ConnectionDefaults::default(),
        }
    }
}

impl Settings {
    /// Connection configuration for a target with these defaults applied
    pub fn connection_config(&self, host: &str, port: u16, username: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(host, port, username);
        config.timeout_secs = self.connection.timeout_secs;
        config.known_hosts_path = self.connection.known_hosts_path.clone();
        config.auto_trust_unknown_host = self.connection.auto_trust_unknown_host;
        config.allow_insecure_host_key = self.connection.allow_insecure_host_key;
        config
    }
}

/// Get the configuration directory
/// Returns %APPDATA%\OxideRemote on Windows, ~/.oxide-remote on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideRemote"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxide-remote"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxide-remote"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Settings storage manager
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Storage at the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load settings from disk.
    ///
    /// A missing file yields defaults. A corrupted file is backed up and
    /// defaults are returned.
    pub async fn load(&self) -> Result<Settings, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) if settings.version > SETTINGS_VERSION => Err(StorageError::VersionTooNew {
                found: settings.version,
                supported: SETTINGS_VERSION,
            }),
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!("Settings file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted settings backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted settings: {}", backup_err)
                    }
                }
                Ok(Settings::default())
            }
        }
    }

    /// Save settings to disk
    pub async fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file next to itself with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = SettingsStorage::with_path(temp.path().join("settings.json"));

        let settings = storage.load().await.unwrap();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.pool.idle_timeout_secs, 300);
        assert!(!settings.connection.auto_trust_unknown_host);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = SettingsStorage::with_path(temp.path().join("nested").join("settings.json"));

        let mut settings = Settings::default();
        settings.pool.max_connections = 8;
        settings.connection.auto_trust_unknown_host = true;
        storage.save(&settings).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.pool.max_connections, 8);
        assert!(loaded.connection.auto_trust_unknown_host);
        assert!(!storage.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = SettingsStorage::with_path(path);

        let settings = storage.load().await.unwrap();
        assert_eq!(settings.pool.health_check_interval_secs, 30);

        let backups: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let err = SettingsStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }

    #[test]
    fn test_connection_defaults_are_applied() {
        let mut settings = Settings::default();
        settings.connection.timeout_secs = 5;
        settings.connection.auto_trust_unknown_host = true;

        let config = settings.connection_config("10.0.0.5", 22, "svc");
        assert_eq!(config.timeout_secs, 5);
        assert!(config.auto_trust_unknown_host);
        assert!(config.key_path.is_none());
    }
}
