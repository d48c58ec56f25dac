//! Configuration Storage
//!
//! Two persistence backends hold connection definitions:
//!
//! - project scope: `<project>/.remotedrive/connections.json`, a
//!   `{ "connections": [...] }` document that may carry plaintext passwords
//! - global scope: `settings.json` in the user config directory
//!   (~/.remotedrive on macOS/Linux, %APPDATA%\RemoteDrive on Windows), with the
//!   connection array under [`GLOBAL_CONNECTIONS_KEY`]; other settings keys
//!   are preserved on write

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ConnectionConfig, ProjectFile, Scope};

/// Settings key that holds the global connection array
pub const GLOBAL_CONNECTIONS_KEY: &str = "remoteDrive.connections";

/// Directory created inside a project to hold its connection file
pub const PROJECT_DIR_NAME: &str = ".remotedrive";

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings key '{0}' is not an array")]
    InvalidSettings(String),
}

/// Get the RemoteDrive configuration directory
/// Returns %APPDATA%\RemoteDrive on Windows, ~/.remotedrive on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("RemoteDrive"));
        }
        dirs::home_dir()
            .map(|home| home.join(".remotedrive"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".remotedrive"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the global settings file path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Directory under which non-Windows mount points are created
pub fn default_mount_root() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("remotedrive")
        .join("mnt")
}

/// A persistence backend for connection definitions
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Scope this backend serves
    fn scope(&self) -> Scope;

    /// Load all definitions; a missing file yields an empty list
    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError>;

    /// Replace all definitions
    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError>;

    /// Insert or replace one definition.
    ///
    /// `previous_name` identifies the entry being replaced when it is renamed.
    async fn upsert(
        &self,
        config: &ConnectionConfig,
        previous_name: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut connections = self.load().await?;
        let key = previous_name.unwrap_or(config.name.as_str());

        match connections.iter().position(|c| c.name == key) {
            Some(index) => connections[index] = config.clone(),
            None => connections.push(config.clone()),
        }
        // A rename must not leave a second entry under the new name
        let mut seen = false;
        connections.retain(|c| {
            if c.name != config.name {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });

        self.save(&connections).await
    }

    /// Remove one definition, returning whether it existed
    async fn remove(&self, name: &str) -> Result<bool, StorageError> {
        let mut connections = self.load().await?;
        let before = connections.len();
        connections.retain(|c| c.name != name);
        if connections.len() == before {
            return Ok(false);
        }
        self.save(&connections).await?;
        Ok(true)
    }
}

/// Write to a temp file first, then rename (atomic write)
async fn write_atomic(path: &Path, contents: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Copy a corrupted file aside so the next save does not destroy it
async fn backup(path: &Path) -> Result<PathBuf, StorageError> {
    let backup_path = path.with_extension(format!(
        "json.backup.{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ));

    if fs::metadata(path).await.is_ok() {
        fs::copy(path, &backup_path).await?;
    }

    Ok(backup_path)
}

/// Read a file, mapping "not found" to `None`
async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

async fn backup_corrupted(path: &Path, err: &serde_json::Error) {
    tracing::warn!("Config file {:?} corrupted: {}", path, err);
    match backup(path).await {
        Ok(backup_path) => {
            tracing::warn!(
                "Corrupted config backed up to {:?}, using defaults",
                backup_path
            );
        }
        Err(backup_err) => {
            tracing::error!("Failed to backup corrupted config: {}", backup_err);
        }
    }
}

/// Project-scope store
pub struct ProjectConfigStore {
    path: PathBuf,
}

impl ProjectConfigStore {
    /// Store rooted at a project directory
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        Self {
            path: project_root
                .as_ref()
                .join(PROJECT_DIR_NAME)
                .join("connections.json"),
        }
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigBackend for ProjectConfigStore {
    fn scope(&self) -> Scope {
        Scope::Project
    }

    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        let Some(contents) = read_optional(&self.path).await? else {
            return Ok(Vec::new());
        };

        match ProjectFile::parse(&contents) {
            Ok((file, 0)) => Ok(file.connections),
            Ok((file, skipped)) => {
                // The next save drops the skipped entries, keep a copy
                tracing::warn!(
                    "{} connection(s) in {:?} could not be read",
                    skipped,
                    self.path
                );
                match backup(&self.path).await {
                    Ok(backup_path) => tracing::warn!("Original kept at {:?}", backup_path),
                    Err(e) => tracing::error!("Failed to backup {:?}: {}", self.path, e),
                }
                Ok(file.connections)
            }
            Err(e) => {
                backup_corrupted(&self.path, &e).await;
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError> {
        let file = ProjectFile {
            connections: connections.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, &json).await
    }
}

/// Global-scope store, one key inside a settings document
pub struct GlobalConfigStore {
    path: PathBuf,
}

impl GlobalConfigStore {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole settings object, `None` when absent or corrupted
    async fn load_settings(&self) -> Result<Option<Map<String, Value>>, StorageError> {
        let Some(contents) = read_optional(&self.path).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Map<String, Value>>(&contents) {
            Ok(settings) => Ok(Some(settings)),
            Err(e) => {
                backup_corrupted(&self.path, &e).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ConfigBackend for GlobalConfigStore {
    fn scope(&self) -> Scope {
        Scope::Global
    }

    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        let Some(mut settings) = self.load_settings().await? else {
            return Ok(Vec::new());
        };

        match settings.remove(GLOBAL_CONNECTIONS_KEY) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value @ Value::Array(_)) => Ok(serde_json::from_value(value)?),
            Some(_) => Err(StorageError::InvalidSettings(
                GLOBAL_CONNECTIONS_KEY.to_string(),
            )),
        }
    }

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError> {
        let mut settings = self.load_settings().await?.unwrap_or_default();

        // The global store never holds plaintext passwords
        let stored: Vec<ConnectionConfig> =
            connections.iter().map(|c| c.without_password()).collect();
        settings.insert(
            GLOBAL_CONNECTIONS_KEY.to_string(),
            serde_json::to_value(stored)?,
        );

        let json = serde_json::to_string_pretty(&Value::Object(settings))?;
        write_atomic(&self.path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Protocol;
    use tempfile::tempdir;

    fn sample(name: &str) -> ConnectionConfig {
        ConnectionConfig::new(name, Protocol::Ftp, "ftp.example.com", "deploy")
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let project = ProjectConfigStore::for_project(temp.path());
        let global = GlobalConfigStore::with_path(temp.path().join("settings.json"));

        assert!(project.load().await.unwrap().is_empty());
        assert!(global.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_save_and_load_keeps_password() {
        let temp = tempdir().unwrap();
        let store = ProjectConfigStore::for_project(temp.path());

        let mut config = sample("site");
        config.password = Some("hunter2".into());
        store.save(&[config]).await.unwrap();

        assert!(store.path().ends_with(".remotedrive/connections.json"));
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"connections\""));

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].password.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_global_preserves_other_settings_and_strips_password() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"editor.fontSize": 14}"#).unwrap();
        let store = GlobalConfigStore::with_path(path.clone());

        let mut config = sample("shared");
        config.password = Some("secret".into());
        store.save(&[config]).await.unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["editor.fontSize"], 14);
        assert_eq!(raw[GLOBAL_CONNECTIONS_KEY][0]["name"], "shared");
        assert!(raw[GLOBAL_CONNECTIONS_KEY][0].get("password").is_none());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].name, "shared");
    }

    #[tokio::test]
    async fn test_global_rejects_non_array_key() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"remoteDrive.connections": 3}"#).unwrap();
        let store = GlobalConfigStore::with_path(path);

        assert!(matches!(
            store.load().await,
            Err(StorageError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ProjectConfigStore::with_path(path);

        assert!(store.load().await.unwrap().is_empty());
        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_unreadable_entry_does_not_drop_the_rest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        std::fs::write(
            &path,
            r#"{"connections":[
                {"name":"pinned","host":"h","username":"u","driveLetter":"Z:"},
                {"name":"broken","host":"h","username":"u","port":"twenty-one"}
            ]}"#,
        )
        .unwrap();
        let store = ProjectConfigStore::with_path(path);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "pinned");
        assert_eq!(loaded[0].drive_letter, Some('Z'));

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_upsert_rename_and_remove() {
        let temp = tempdir().unwrap();
        let store = ProjectConfigStore::for_project(temp.path());

        store.upsert(&sample("a"), None).await.unwrap();
        store.upsert(&sample("b"), None).await.unwrap();

        let mut renamed = sample("c");
        renamed.port = 2121;
        store.upsert(&renamed, Some("a")).await.unwrap();

        let names: Vec<String> = store.load().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["c", "b"]);

        assert!(store.remove("b").await.unwrap());
        assert!(!store.remove("b").await.unwrap());
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
