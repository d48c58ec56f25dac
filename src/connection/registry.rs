//! Connection Registry
//!
//! 所有已配置远程驱动器的内存表，与界面完全解耦。
//!
//! # 架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionRegistry                                          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Connection (keyed by name)                            │  │
//! │  │  ├── config + scope + password_source                  │  │
//! │  │  ├── status: ConnectionStatus                          │  │
//! │  │  ├── mount_point / process / control_port              │  │
//! │  │  └── health_failures, last_error, attempt_id           │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  HealthMonitor (one periodic task)                           │
//! └──────────────────────────────────────────────────────────────┘
//!      │ load/save        │ secrets          │ spawn/probe/kill
//!      ▼                  ▼                  ▼
//!  ConfigBackend    CredentialVault     MountBackend
//!  (project/global)
//! ```
//!
//! # 并发约定
//!
//! - 表项只在短的同步临界区内修改，任何 `.await` 期间都不持有 DashMap 引用
//! - 每次 connect/disconnect 生成新的 `attempt_id`；异步操作完成后，只有
//!   attempt_id 未变且表项仍存在时才写回结果，避免旧任务覆盖新状态
//! - 状态变更事件总是在表项修改之后发送

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::error::RegistryError;
use super::events::{ConnectionEvent, ConnectionEventEmitter};
use super::health::HealthMonitor;
use super::hooks::{FrontendHooks, NoopFrontend};
use super::state::ConnectionStatus;
use crate::config::{
    default_mount_root, merge_by_name, password_source, split_password, ConfigBackend,
    ConnectionConfig, CredentialVault, GlobalConfigStore, Keychain, PasswordSource,
    ProjectConfigStore, Scope,
};
use crate::mount::drive::{self, MountPoint, MountTable, SystemMountTable};
use crate::mount::{MountBackend, MountError, MountProcess, MountSpec, ProcessHandle, RcloneBackend};
use crate::tracking::join_relative;

/// Error message recorded when the health monitor drops a mount
pub const CONNECTION_LOST: &str = "Connection lost";

fn connection_lost_message() -> String {
    RegistryError::HealthCheckLost.to_string()
}

/// 健康检查间隔（30 秒）
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// 单次探测超时（5 秒）
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// 连续失败次数阈值，达到后判定连接丢失
const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// 挂载就绪等待上限
const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 15;

/// 挂载就绪轮询间隔
const DEFAULT_MOUNT_POLL_INTERVAL_MS: u64 = 500;

/// Connection test (directory listing) timeout
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 20;

/// Registry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryOptions {
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Consecutive probe failures before a mount is declared lost
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    #[serde(default = "default_mount_timeout_secs")]
    pub mount_timeout_secs: u64,

    #[serde(default = "default_mount_poll_interval_ms")]
    pub mount_poll_interval_ms: u64,

    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// rclone executable, resolved through PATH when relative
    #[serde(default = "default_rclone_path")]
    pub rclone_path: PathBuf,

    /// Parent directory for mount points outside Windows
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
}

fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_health_failure_threshold() -> u32 {
    DEFAULT_HEALTH_FAILURE_THRESHOLD
}

fn default_mount_timeout_secs() -> u64 {
    DEFAULT_MOUNT_TIMEOUT_SECS
}

fn default_mount_poll_interval_ms() -> u64 {
    DEFAULT_MOUNT_POLL_INTERVAL_MS
}

fn default_test_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT_SECS
}

fn default_rclone_path() -> PathBuf {
    PathBuf::from("rclone")
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            mount_timeout_secs: DEFAULT_MOUNT_TIMEOUT_SECS,
            mount_poll_interval_ms: DEFAULT_MOUNT_POLL_INTERVAL_MS,
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            rclone_path: default_rclone_path(),
            mount_root: default_mount_root(),
        }
    }
}

impl RegistryOptions {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn mount_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mount_poll_interval_ms.max(10))
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

/// A configured remote and its runtime state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub config: ConnectionConfig,
    pub scope: Scope,
    pub status: ConnectionStatus,
    pub password_source: PasswordSource,
    /// Set only while connected
    pub mount_point: Option<MountPoint>,
    /// Set only while connected
    pub process: Option<ProcessHandle>,
    /// Set only while connected
    pub control_port: Option<u16>,
    /// Consecutive failed liveness probes
    pub health_failures: u32,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Generation of the last connect/disconnect request
    #[serde(skip)]
    attempt_id: u64,
}

impl Connection {
    fn new(config: ConnectionConfig, scope: Scope, password_source: PasswordSource) -> Self {
        Self {
            config,
            scope,
            status: ConnectionStatus::Disconnected,
            password_source,
            mount_point: None,
            process: None,
            control_port: None,
            health_failures: 0,
            last_error: None,
            connected_at: None,
            attempt_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Copy handed to consumers, never carries a password
    fn snapshot(&self) -> Self {
        let mut copy = self.clone();
        copy.config.password = None;
        copy
    }

    /// Apply a state change if the transition table allows it
    fn transition(&mut self, next: ConnectionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "Rejected transition {} -> {} for connection '{}'",
                self.status, next, self.config.name
            );
            return false;
        }
        debug!(
            "Connection '{}': {} -> {}",
            self.config.name, self.status, next
        );
        self.status = next;
        true
    }

    fn clear_mount(&mut self) {
        self.mount_point = None;
        self.process = None;
        self.control_port = None;
        self.connected_at = None;
    }
}

/// Builder for [`ConnectionRegistry`]; anything not supplied uses the
/// production implementation
#[derive(Default)]
pub struct RegistryBuilder {
    project_store: Option<Arc<dyn ConfigBackend>>,
    global_store: Option<Arc<dyn ConfigBackend>>,
    vault: Option<Arc<dyn CredentialVault>>,
    backend: Option<Arc<dyn MountBackend>>,
    mount_table: Option<Arc<dyn MountTable>>,
    frontend: Option<Arc<dyn FrontendHooks>>,
    options: Option<RegistryOptions>,
}

impl RegistryBuilder {
    /// Use the project directory's connection file as the project scope
    pub fn project_root(mut self, root: impl AsRef<Path>) -> Self {
        self.project_store = Some(Arc::new(ProjectConfigStore::for_project(root)));
        self
    }

    pub fn project_store(mut self, store: Arc<dyn ConfigBackend>) -> Self {
        self.project_store = Some(store);
        self
    }

    pub fn global_store(mut self, store: Arc<dyn ConfigBackend>) -> Self {
        self.global_store = Some(store);
        self
    }

    pub fn vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn MountBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn mount_table(mut self, table: Arc<dyn MountTable>) -> Self {
        self.mount_table = Some(table);
        self
    }

    pub fn frontend(mut self, frontend: Arc<dyn FrontendHooks>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> Result<Arc<ConnectionRegistry>, RegistryError> {
        let options = self.options.unwrap_or_default();

        let global_store = match self.global_store {
            Some(store) => store,
            None => Arc::new(GlobalConfigStore::new()?),
        };
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(RcloneBackend::new(options.rclone_path.clone())));

        Ok(Arc::new(ConnectionRegistry {
            connections: DashMap::new(),
            project_store: self.project_store,
            global_store,
            vault: self.vault.unwrap_or_else(|| Arc::new(Keychain::new())),
            backend,
            mount_table: self
                .mount_table
                .unwrap_or_else(|| Arc::new(SystemMountTable::new())),
            frontend: self.frontend.unwrap_or_else(|| Arc::new(NoopFrontend)),
            events: ConnectionEventEmitter::new(),
            monitor: HealthMonitor::new(options.health_interval()),
            options,
            reserved_letters: Mutex::new(HashMap::new()),
            stale_entries: Mutex::new(Vec::new()),
            attempt_seq: AtomicU64::new(0),
        }))
    }
}

/// The connection table and its lifecycle operations
pub struct ConnectionRegistry {
    /// 所有已知连接（按名称）
    connections: DashMap<String, Connection>,

    project_store: Option<Arc<dyn ConfigBackend>>,
    global_store: Arc<dyn ConfigBackend>,
    vault: Arc<dyn CredentialVault>,
    backend: Arc<dyn MountBackend>,
    mount_table: Arc<dyn MountTable>,
    frontend: Arc<dyn FrontendHooks>,
    options: RegistryOptions,
    events: ConnectionEventEmitter,
    monitor: HealthMonitor,

    /// Letters picked by in-flight connects: name -> (attempt_id, letter)
    reserved_letters: Mutex<HashMap<String, (u64, char)>>,

    /// Copies left in the old scope by an interrupted scope move
    stale_entries: Mutex<Vec<(Scope, String)>>,

    attempt_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Whether a project store is configured
    pub fn has_project_context(&self) -> bool {
        self.project_store.is_some()
    }

    fn next_attempt_id(&self) -> u64 {
        self.attempt_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ========================================================================
    // Read API
    // ========================================================================

    /// All connections, sorted by name
    pub fn get_connections(&self) -> Vec<Connection> {
        let mut list: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        list.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        list
    }

    pub fn get_connection(&self, name: &str) -> Option<Connection> {
        self.connections.get(name).map(|entry| entry.value().snapshot())
    }

    /// Connections that are currently mounted
    pub fn get_active_connections(&self) -> Vec<Connection> {
        self.get_connections()
            .into_iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .collect()
    }

    /// Change notifications (onDidChangeConnections)
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn has_connected(&self) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.status == ConnectionStatus::Connected)
    }

    /// Local root of a connected mount
    pub fn mount_path(&self, name: &str) -> Option<PathBuf> {
        let entry = self.connections.get(name)?;
        if entry.status != ConnectionStatus::Connected {
            return None;
        }
        entry.mount_point.as_ref().map(|mp| mp.path.clone())
    }

    /// Map a path relative to the remote root onto the local mount
    pub fn resolve_local_path(&self, name: &str, relative: &str) -> Result<PathBuf, RegistryError> {
        if !self.connections.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let root = self
            .mount_path(name)
            .ok_or_else(|| RegistryError::NotConnected(name.to_string()))?;

        join_relative(&root, relative)
            .ok_or_else(|| RegistryError::InvalidPath(relative.to_string()))
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// (Re)load the table from both stores.
    ///
    /// A store that cannot be read contributes nothing; runtime state of
    /// entries that still exist is kept, entries that vanished are
    /// disconnected and dropped. Returns the number of connections.
    pub async fn load(&self) -> usize {
        let project = match &self.project_store {
            Some(store) => store.load().await.unwrap_or_else(|e| {
                error!("Failed to load project connections: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let global = self.global_store.load().await.unwrap_or_else(|e| {
            error!("Failed to load global connections: {}", e);
            Vec::new()
        });

        let merged = merge_by_name(project, global);
        let names: HashSet<&str> = merged.iter().map(|(c, _)| c.name.as_str()).collect();

        let vanished: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !names.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        for name in vanished {
            let active = self
                .get_connection(&name)
                .is_some_and(|c| c.status != ConnectionStatus::Disconnected);
            if active {
                if let Err(e) = self.disconnect(&name).await {
                    warn!("Failed to disconnect removed connection '{}': {}", name, e);
                }
            }
            self.connections.remove(&name);
            info!("Connection '{}' no longer configured, dropped", name);
        }

        for (config, scope) in merged {
            let source = password_source(&config, scope, self.vault.as_ref());
            self.connections
                .entry(config.name.clone())
                .and_modify(|entry| {
                    entry.config = config.clone();
                    entry.scope = scope;
                    entry.password_source = source;
                })
                .or_insert_with(|| Connection::new(config, scope, source));
        }

        let count = self.connections.len();
        info!("Loaded {} connections", count);
        self.events.emit(ConnectionEvent::Reloaded { count });
        count
    }

    /// Re-read both stores after an external edit
    pub async fn reload(&self) -> usize {
        debug!("Reloading connections");
        self.load().await
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Mount a connection.
    ///
    /// Already connected is a no-op; a connect or disconnect in flight is
    /// rejected with [`RegistryError::Busy`]. Failures are recorded on the
    /// entry (status `Error` + message) and returned.
    pub async fn connect(self: &Arc<Self>, name: &str) -> Result<(), RegistryError> {
        let attempt_id = self.next_attempt_id();

        let (config, scope, leftover) = {
            let mut entry = self
                .connections
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

            match entry.status {
                ConnectionStatus::Connected => {
                    debug!("Connection '{}' already connected", name);
                    return Ok(());
                }
                status if status.is_in_flight() => {
                    return Err(RegistryError::Busy {
                        name: name.to_string(),
                        status,
                    });
                }
                _ => {}
            }

            entry.transition(ConnectionStatus::Connecting);
            entry.last_error = None;
            entry.health_failures = 0;
            entry.attempt_id = attempt_id;
            // A failed disconnect leaves its process behind
            (entry.config.clone(), entry.scope, entry.process)
        };
        self.events
            .emit_status(name, ConnectionStatus::Connecting, None);

        if let Some(handle) = leftover {
            if let Err(err) = self.stop_leftover(name, attempt_id, handle).await {
                self.record_connect_failure(name, attempt_id, &err);
                return Err(err);
            }
        }

        info!(
            "Connecting '{}' -> {}://{}@{}:{}{}",
            name,
            config.protocol.as_str(),
            config.username,
            config.host,
            config.effective_port(),
            config.remote_path
        );

        match self.establish(name, attempt_id, &config, scope).await {
            Ok((mount_point, process)) => {
                self.commit_connected(name, attempt_id, mount_point, process)
                    .await
            }
            Err(err) => {
                self.record_connect_failure(name, attempt_id, &err);
                Err(err)
            }
        }
    }

    /// Connect every `auto_connect` entry that is disconnected.
    /// Returns how many connected.
    pub async fn connect_auto(self: &Arc<Self>) -> usize {
        let mut names: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| {
                entry.config.auto_connect && entry.status == ConnectionStatus::Disconnected
            })
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();

        let mut connected = 0;
        for name in names {
            match self.connect(&name).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("Auto-connect of '{}' failed: {}", name, e),
            }
        }
        connected
    }

    /// Stop the process a failed disconnect kept, before mounting again
    async fn stop_leftover(
        &self,
        name: &str,
        attempt_id: u64,
        handle: ProcessHandle,
    ) -> Result<(), RegistryError> {
        info!("Stopping leftover mount process {} of '{}'", handle, name);
        match self.backend.terminate(handle).await {
            Ok(()) => {}
            Err(MountError::UnknownProcess(pid)) => {
                debug!("Mount process {} already gone", pid);
            }
            Err(e) => return Err(RegistryError::Terminate(e)),
        }

        if let Some(mut entry) = self.connections.get_mut(name) {
            if entry.attempt_id == attempt_id && entry.process == Some(handle) {
                entry.clear_mount();
            }
        }
        Ok(())
    }

    /// Credential, mount point, spawn, readiness
    async fn establish(
        &self,
        name: &str,
        attempt_id: u64,
        config: &ConnectionConfig,
        scope: Scope,
    ) -> Result<(MountPoint, MountProcess), RegistryError> {
        let password = self
            .resolve_credential(name, attempt_id, config, scope)
            .await?;
        let mount_point = self.reserve_mount_point(name, attempt_id, config)?;

        let spec = MountSpec::new(config, &password, mount_point.clone());
        let process = self
            .backend
            .spawn(&spec)
            .await
            .map_err(RegistryError::BackendSpawn)?;

        if let Err(err) = self.wait_until_mounted(name, &mount_point).await {
            warn!(
                "Mount for '{}' never became ready, stopping {}",
                name, process.handle
            );
            if let Err(e) = self.backend.terminate(process.handle).await {
                warn!("Failed to stop {}: {}", process.handle, e);
            }
            return Err(err);
        }

        Ok((mount_point, process))
    }

    fn vault_password(&self, name: &str) -> Option<String> {
        match self.vault.get(name) {
            Ok(secret) => secret.filter(|s| !s.is_empty()),
            Err(e) => {
                warn!("Vault lookup for '{}' failed: {}", name, e);
                None
            }
        }
    }

    /// Password precedence: project file, vault, prompt (saved to the vault)
    async fn resolve_credential(
        &self,
        name: &str,
        attempt_id: u64,
        config: &ConnectionConfig,
        scope: Scope,
    ) -> Result<String, RegistryError> {
        let embedded = match scope {
            Scope::Project => config.embedded_password(),
            Scope::Global => None,
        };

        let (password, source) = if let Some(password) = embedded {
            (password.to_string(), PasswordSource::ProjectFile)
        } else if let Some(password) = self.vault_password(name) {
            (password, PasswordSource::Vault)
        } else {
            let password = self
                .frontend
                .prompt_password(config)
                .await
                .filter(|p| !p.is_empty())
                .ok_or_else(|| RegistryError::Credential(name.to_string()))?;

            // Prompted passwords go to the vault, never into the project file
            let source = match self.vault.store(name, &password) {
                Ok(()) => PasswordSource::Vault,
                Err(e) => {
                    warn!("Could not save password for '{}' to the vault: {}", name, e);
                    PasswordSource::None
                }
            };
            (password, source)
        };

        if let Some(mut entry) = self.connections.get_mut(name) {
            if entry.attempt_id == attempt_id {
                entry.password_source = source;
            }
        }

        Ok(password)
    }

    /// Allocate a letter and hold it until the connect completes
    fn reserve_mount_point(
        &self,
        name: &str,
        attempt_id: u64,
        config: &ConnectionConfig,
    ) -> Result<MountPoint, RegistryError> {
        let mut reserved = self.reserved_letters.lock();

        let mut held: HashSet<char> = self
            .connections
            .iter()
            .filter(|entry| entry.key().as_str() != name)
            .filter_map(|entry| entry.mount_point.as_ref().map(|mp| mp.letter))
            .collect();
        held.extend(
            reserved
                .iter()
                .filter(|(owner, _)| owner.as_str() != name)
                .map(|(_, (_, letter))| *letter),
        );

        let host = drive::occupied_letters(
            &self.mount_table.mounted_paths(),
            &self.options.mount_root,
        );
        let letter = drive::allocate(config.drive_letter, &held, &host)?;

        reserved.insert(name.to_string(), (attempt_id, letter));
        debug!("Reserved drive letter {} for '{}'", letter, name);

        Ok(MountPoint::for_letter(letter, &self.options.mount_root))
    }

    fn release_reservation(&self, name: &str, attempt_id: u64) {
        let mut reserved = self.reserved_letters.lock();
        if reserved.get(name).is_some_and(|(owner, _)| *owner == attempt_id) {
            reserved.remove(name);
        }
    }

    /// Poll the host mount table until the mount point shows up
    async fn wait_until_mounted(
        &self,
        name: &str,
        mount_point: &MountPoint,
    ) -> Result<(), RegistryError> {
        let timeout = self.options.mount_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.mount_table.is_mounted(mount_point) {
                debug!("Mount point {} for '{}' is ready", mount_point, name);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistryError::MountTimeout {
                    name: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.options.mount_poll_interval()).await;
        }
    }

    async fn commit_connected(
        self: &Arc<Self>,
        name: &str,
        attempt_id: u64,
        mount_point: MountPoint,
        process: MountProcess,
    ) -> Result<(), RegistryError> {
        // 检查连接是否仍然存在，且没有被新的操作取代
        let committed = match self.connections.get_mut(name) {
            Some(mut entry)
                if entry.attempt_id == attempt_id
                    && entry.status == ConnectionStatus::Connecting =>
            {
                entry.transition(ConnectionStatus::Connected);
                entry.mount_point = Some(mount_point.clone());
                entry.process = Some(process.handle);
                entry.control_port = Some(process.control_port);
                entry.connected_at = Some(Utc::now());
                entry.health_failures = 0;
                true
            }
            _ => false,
        };
        self.release_reservation(name, attempt_id);

        if !committed {
            warn!(
                "Connect for '{}' was superseded, stopping orphaned {}",
                name, process.handle
            );
            if let Err(e) = self.backend.terminate(process.handle).await {
                warn!("Failed to stop {}: {}", process.handle, e);
            }
            return Err(RegistryError::Cancelled(name.to_string()));
        }

        info!("Connection '{}' mounted at {}", name, mount_point);
        self.events
            .emit_status(name, ConnectionStatus::Connected, None);
        self.monitor.ensure_running(Arc::downgrade(self));
        Ok(())
    }

    fn record_connect_failure(&self, name: &str, attempt_id: u64, err: &RegistryError) {
        self.release_reservation(name, attempt_id);

        let message = err.to_string();
        let recorded = match self.connections.get_mut(name) {
            Some(mut entry)
                if entry.attempt_id == attempt_id
                    && entry.status == ConnectionStatus::Connecting =>
            {
                entry.transition(ConnectionStatus::Error);
                entry.last_error = Some(message.clone());
                true
            }
            _ => false,
        };

        if recorded {
            error!("Connect '{}' failed: {}", name, message);
            self.events
                .emit_status(name, ConnectionStatus::Error, Some(message));
        } else {
            debug!("Connect '{}' failed after being superseded: {}", name, message);
        }
    }

    // ========================================================================
    // Disconnect
    // ========================================================================

    /// Unmount a connection.
    ///
    /// No-op (and no notification) when already disconnected. A connect in
    /// flight is cancelled. If the mount process cannot be stopped the entry
    /// ends in `Error`, keeping its process handle for a retry.
    pub async fn disconnect(&self, name: &str) -> Result<(), RegistryError> {
        let attempt_id = self.next_attempt_id();

        let (mount_point, process) = {
            let mut entry = self
                .connections
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

            match entry.status {
                ConnectionStatus::Disconnected => {
                    debug!("Connection '{}' already disconnected", name);
                    return Ok(());
                }
                ConnectionStatus::Disconnecting => {
                    return Err(RegistryError::Busy {
                        name: name.to_string(),
                        status: entry.status,
                    });
                }
                ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Error => {}
            }

            entry.transition(ConnectionStatus::Disconnecting);
            entry.attempt_id = attempt_id;
            (entry.mount_point.clone(), entry.process)
        };
        self.events
            .emit_status(name, ConnectionStatus::Disconnecting, None);
        info!("Disconnecting '{}'", name);

        if let Some(mount_point) = &mount_point {
            if let Err(e) = self.frontend.close_editors_under(&mount_point.path).await {
                warn!("Failed to close editors under {}: {}", mount_point, e);
            }
        }

        let result = match process {
            Some(handle) => match self.backend.terminate(handle).await {
                Err(MountError::UnknownProcess(pid)) => {
                    debug!("Mount process {} already gone", pid);
                    Ok(())
                }
                other => other,
            },
            None => Ok(()),
        };

        let failure = {
            let Some(mut entry) = self.connections.get_mut(name) else {
                debug!("Connection '{}' removed while disconnecting", name);
                return Ok(());
            };
            if entry.attempt_id != attempt_id {
                debug!("Disconnect of '{}' superseded", name);
                return Ok(());
            }

            match result {
                Ok(()) => {
                    entry.transition(ConnectionStatus::Disconnected);
                    entry.clear_mount();
                    entry.health_failures = 0;
                    None
                }
                Err(e) => {
                    entry.transition(ConnectionStatus::Error);
                    entry.last_error = Some(format!("Failed to stop mount: {}", e));
                    Some(e)
                }
            }
        };

        match failure {
            None => {
                info!("Connection '{}' disconnected", name);
                self.events
                    .emit_status(name, ConnectionStatus::Disconnected, None);
                Ok(())
            }
            Some(e) => {
                let message = format!("Failed to stop mount: {}", e);
                error!("Disconnect '{}' failed: {}", name, message);
                self.events
                    .emit_status(name, ConnectionStatus::Error, Some(message));
                Err(RegistryError::Terminate(e))
            }
        }
    }

    /// Disconnect every connected or connecting entry; one failure does
    /// not stop the rest
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| {
                matches!(
                    entry.status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                )
            })
            .map(|entry| entry.key().clone())
            .collect();

        info!("Disconnecting {} connections...", names.len());
        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                warn!("Failed to disconnect '{}': {}", name, e);
            }
        }
    }

    /// Stop the health monitor and unmount everything
    pub async fn dispose(&self) {
        self.monitor.stop();
        self.disconnect_all().await;
        info!("Connection registry disposed");
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// One health sweep over all connected entries
    pub async fn run_health_check(&self) {
        let targets: Vec<(String, u64, u16)> = self
            .connections
            .iter()
            .filter(|entry| entry.status == ConnectionStatus::Connected)
            .filter_map(|entry| {
                entry
                    .control_port
                    .map(|port| (entry.key().clone(), entry.attempt_id, port))
            })
            .collect();

        for (name, attempt_id, port) in targets {
            let result = self
                .backend
                .probe(port, self.options.probe_timeout())
                .await;
            self.record_probe_result(&name, attempt_id, result).await;
        }
    }

    /// Apply one probe outcome.
    ///
    /// Results for entries that were removed, disconnected or reconnected
    /// while the probe ran are discarded.
    pub(crate) async fn record_probe_result(
        &self,
        name: &str,
        attempt_id: u64,
        result: Result<(), MountError>,
    ) {
        let threshold = self.options.health_failure_threshold.max(1);

        let lost = {
            let Some(mut entry) = self.connections.get_mut(name) else {
                debug!("Probe result for removed connection '{}' ignored", name);
                return;
            };
            if entry.attempt_id != attempt_id || entry.status != ConnectionStatus::Connected {
                debug!("Connection '{}' changed during probe, result ignored", name);
                return;
            }

            match result {
                Ok(()) => {
                    if entry.health_failures > 0 {
                        info!(
                            "Connection '{}' healthy again after {} failed probes",
                            name, entry.health_failures
                        );
                    }
                    entry.health_failures = 0;
                    None
                }
                Err(e) => {
                    entry.health_failures += 1;
                    warn!(
                        "Health check for '{}' failed ({}/{}): {}",
                        name, entry.health_failures, threshold, e
                    );
                    if entry.health_failures < threshold {
                        None
                    } else {
                        entry.transition(ConnectionStatus::Disconnected);
                        entry.last_error = Some(connection_lost_message());
                        let process = entry.process.take();
                        let mount_point = entry.mount_point.take();
                        entry.clear_mount();
                        Some((process, mount_point))
                    }
                }
            }
        };

        let Some((process, mount_point)) = lost else {
            return;
        };

        error!(
            "Connection '{}' lost after {} failed health checks",
            name, threshold
        );
        self.events.emit_status(
            name,
            ConnectionStatus::Disconnected,
            Some(connection_lost_message()),
        );
        self.events.emit(ConnectionEvent::ConnectionLost {
            name: name.to_string(),
        });

        // The process may be wedged rather than dead
        if let Some(handle) = process {
            match self.backend.terminate(handle).await {
                Ok(()) | Err(MountError::UnknownProcess(_)) => {}
                Err(e) => warn!("Failed to stop stale {} for '{}': {}", handle, name, e),
            }
        }
        if let Some(mount_point) = mount_point {
            debug!("Released {} from lost connection '{}'", mount_point, name);
        }

        self.frontend.connection_lost(name, CONNECTION_LOST).await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    pub(crate) fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    // ========================================================================
    // Configuration CRUD
    // ========================================================================

    fn default_scope(&self) -> Scope {
        if self.project_store.is_some() {
            Scope::Project
        } else {
            Scope::Global
        }
    }

    fn store_for(&self, scope: Scope) -> Result<Arc<dyn ConfigBackend>, RegistryError> {
        match scope {
            Scope::Project => self
                .project_store
                .clone()
                .ok_or(RegistryError::NoStore(Scope::Project)),
            Scope::Global => Ok(self.global_store.clone()),
        }
    }

    /// Retry removals left behind by an interrupted scope move
    async fn cleanup_stale_entries(&self) {
        let pending = std::mem::take(&mut *self.stale_entries.lock());

        for (scope, name) in pending {
            // The name moved back into this scope; the copy is live again
            if self.connections.get(&name).map(|e| e.scope) == Some(scope) {
                continue;
            }
            let Ok(store) = self.store_for(scope) else {
                continue;
            };
            match store.remove(&name).await {
                Ok(_) => info!("Removed stale {} copy of '{}'", scope, name),
                Err(e) => {
                    warn!("Stale {} copy of '{}' still present: {}", scope, name, e);
                    self.stale_entries.lock().push((scope, name));
                }
            }
        }
    }

    /// Add a new connection to one store (Project by default when a
    /// project is open, else Global)
    pub async fn add_connection(
        &self,
        config: ConnectionConfig,
        scope: Option<Scope>,
    ) -> Result<Connection, RegistryError> {
        config.validate()?;
        if self.connections.contains_key(&config.name) {
            return Err(RegistryError::AlreadyExists(config.name));
        }

        let scope = scope.unwrap_or_else(|| self.default_scope());
        let store = self.store_for(scope)?;

        let (stored, vault_password) = split_password(config, scope);
        if let Some(password) = &vault_password {
            self.vault.store(&stored.name, password)?;
        }

        store.upsert(&stored, None).await?;
        self.cleanup_stale_entries().await;

        let source = password_source(&stored, scope, self.vault.as_ref());
        let connection = Connection::new(stored, scope, source);
        let snapshot = connection.snapshot();
        let name = connection.config.name.clone();
        self.connections.insert(name.clone(), connection);

        info!("Added connection '{}' ({} scope)", name, scope);
        self.events.emit(ConnectionEvent::Added { name, scope });
        Ok(snapshot)
    }

    /// Replace a connection's definition, optionally renaming it or moving it
    /// to another scope.
    ///
    /// A config without a password keeps the one embedded in the project
    /// file, so an edit built from a snapshot does not drop it; an empty
    /// password clears it. On a rename
    /// the vault entry follows only once the store write succeeded.
    ///
    /// A scope move writes the new store first and deletes from the old one
    /// only after that write succeeded. If the delete fails the entry stays
    /// in both stores (the project copy shadows the global one on load) and
    /// [`RegistryError::ScopeMoveIncomplete`] is returned; the removal is
    /// retried after the next successful save.
    pub async fn update_connection(
        &self,
        old_name: &str,
        mut config: ConnectionConfig,
        scope: Option<Scope>,
    ) -> Result<Connection, RegistryError> {
        config.validate()?;

        let (old_scope, status, kept_password) = self
            .connections
            .get(old_name)
            .map(|entry| {
                let kept = match entry.scope {
                    Scope::Project => entry.config.embedded_password().map(str::to_string),
                    Scope::Global => None,
                };
                (entry.scope, entry.status, kept)
            })
            .ok_or_else(|| RegistryError::NotFound(old_name.to_string()))?;

        // Snapshots never carry the password; keep the one in the project file
        match config.password.as_deref() {
            None => config.password = kept_password,
            Some("") => config.password = None,
            Some(_) => {}
        }

        let renamed = config.name != old_name;
        if renamed && self.connections.contains_key(&config.name) {
            return Err(RegistryError::AlreadyExists(config.name));
        }

        let new_scope = scope.unwrap_or(old_scope);
        let new_store = self.store_for(new_scope)?;
        let old_store = self.store_for(old_scope)?;

        if renamed && status != ConnectionStatus::Disconnected {
            info!("Renaming active connection '{}', disconnecting first", old_name);
            if let Err(e) = self.disconnect(old_name).await {
                warn!("Disconnect before rename of '{}' failed: {}", old_name, e);
            }
        }

        let (stored, vault_password) = split_password(config, new_scope);

        if let Some(password) = &vault_password {
            self.vault.store(&stored.name, password)?;
        }

        // 先写入新存储，确认成功后才移动密钥或删除旧存储中的条目
        let previous = (new_scope == old_scope).then_some(old_name);
        if let Err(e) = new_store.upsert(&stored, previous).await {
            if renamed && vault_password.is_some() {
                if let Err(e) = self.vault.delete(&stored.name) {
                    warn!("Failed to roll back vault entry '{}': {}", stored.name, e);
                }
            }
            return Err(e.into());
        }
        self.cleanup_stale_entries().await;

        if renamed {
            let moved = if vault_password.is_some() {
                self.vault.delete(old_name).map(|()| false)
            } else {
                self.vault.rename(old_name, &stored.name)
            };
            match moved {
                Ok(true) => debug!("Moved vault entry '{}' -> '{}'", old_name, stored.name),
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to move vault entry '{}' -> '{}': {}",
                    old_name, stored.name, e
                ),
            }
        }

        let mut move_error = None;
        if new_scope != old_scope {
            if let Err(e) = old_store.remove(old_name).await {
                warn!(
                    "Connection '{}' is now in both {} and {} scope until the next save: {}",
                    old_name, old_scope, new_scope, e
                );
                self.stale_entries
                    .lock()
                    .push((old_scope, old_name.to_string()));
                move_error = Some(e);
            }
        }

        let source = password_source(&stored, new_scope, self.vault.as_ref());
        let mut connection = match self.connections.remove(old_name) {
            Some((_, mut existing)) => {
                existing.config = stored;
                existing.scope = new_scope;
                existing.password_source = source;
                existing
            }
            None => Connection::new(stored, new_scope, source),
        };
        if renamed {
            connection.attempt_id = self.next_attempt_id();
        }
        let snapshot = connection.snapshot();
        let name = snapshot.config.name.clone();
        self.connections.insert(name.clone(), connection);

        info!(
            "Updated connection '{}' -> '{}' ({} scope)",
            old_name, name, new_scope
        );
        self.events.emit(ConnectionEvent::Updated {
            old_name: old_name.to_string(),
            name: name.clone(),
            scope: new_scope,
        });

        match move_error {
            Some(source) => Err(RegistryError::ScopeMoveIncomplete {
                name,
                from: old_scope,
                to: new_scope,
                source,
            }),
            None => Ok(snapshot),
        }
    }

    /// Remove a connection from its store, disconnecting it first
    pub async fn remove_connection(&self, name: &str) -> Result<(), RegistryError> {
        let (scope, status) = self
            .connections
            .get(name)
            .map(|entry| (entry.scope, entry.status))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if status != ConnectionStatus::Disconnected {
            if let Err(e) = self.disconnect(name).await {
                warn!("Forced disconnect of '{}' failed: {}", name, e);
            }
        }

        let store = self.store_for(scope)?;
        store.remove(name).await?;
        self.cleanup_stale_entries().await;

        self.connections.remove(name);
        if let Err(e) = self.vault.delete(name) {
            warn!("Failed to delete vault entry for '{}': {}", name, e);
        }

        info!("Removed connection '{}' ({} scope)", name, scope);
        self.events.emit(ConnectionEvent::Removed {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Resolve a password and list the remote root, without touching the
    /// table, the stores or the vault
    pub async fn test_connection(
        &self,
        config: &ConnectionConfig,
        password: Option<&str>,
    ) -> Result<Vec<String>, RegistryError> {
        config.validate()?;

        let password = match password.filter(|p| !p.is_empty()) {
            Some(password) => password.to_string(),
            None => match config.embedded_password() {
                Some(password) => password.to_string(),
                None => match self.vault_password(&config.name) {
                    Some(password) => password,
                    None => self
                        .frontend
                        .prompt_password(config)
                        .await
                        .filter(|p| !p.is_empty())
                        .ok_or_else(|| RegistryError::Credential(config.name.clone()))?,
                },
            },
        };

        let entries = self
            .backend
            .list_dir(config, &password, self.options.test_timeout())
            .await
            .map_err(RegistryError::TestFailed)?;

        info!(
            "Connection test for '{}' succeeded ({} entries)",
            config.name,
            entries.len()
        );
        Ok(entries)
    }
}
