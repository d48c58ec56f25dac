//! In-memory doubles for registry tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::hooks::FrontendHooks;
use super::registry::{ConnectionRegistry, RegistryOptions};
use crate::config::{
    ConfigBackend, ConnectionConfig, CredentialVault, KeychainError, MemoryVault, Protocol, Scope,
    StorageError,
};
use crate::mount::{
    MountBackend, MountError, MountProcess, MountSpec, MountTable, ProcessHandle,
};

pub fn sample(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(name, Protocol::Ftp, "ftp.example.com", "deploy")
}

// ============================================================================
// Stores
// ============================================================================

pub struct MemoryStore {
    scope: Scope,
    entries: Mutex<Vec<ConnectionConfig>>,
    fail_load: AtomicBool,
    fail_remove: AtomicBool,
}

impl MemoryStore {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            entries: Mutex::new(Vec::new()),
            fail_load: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
        }
    }

    pub fn fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigBackend for MemoryStore {
    fn scope(&self) -> Scope {
        self.scope
    }

    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidSettings("unreadable".into()));
        }
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError> {
        *self.entries.lock() = connections.to_vec();
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, StorageError> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )));
        }
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|c| c.name != name);
        Ok(entries.len() != before)
    }
}

// ============================================================================
// Vault
// ============================================================================

/// MemoryVault that counts lookups
#[derive(Default)]
pub struct SpyVault {
    inner: MemoryVault,
    gets: AtomicUsize,
}

impl SpyVault {
    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl CredentialVault for SpyVault {
    fn get(&self, connection_name: &str) -> Result<Option<String>, KeychainError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(connection_name)
    }

    fn store(&self, connection_name: &str, secret: &str) -> Result<(), KeychainError> {
        self.inner.store(connection_name, secret)
    }

    fn delete(&self, connection_name: &str) -> Result<(), KeychainError> {
        self.inner.delete(connection_name)
    }
}

// ============================================================================
// Mount table and backend
// ============================================================================

#[derive(Default)]
pub struct FakeMountTable {
    paths: Mutex<Vec<PathBuf>>,
}

impl FakeMountTable {
    pub fn mount(&self, path: PathBuf) {
        self.paths.lock().push(path);
    }

    pub fn unmount(&self, path: &PathBuf) {
        self.paths.lock().retain(|p| p != path);
    }
}

impl MountTable for FakeMountTable {
    fn mounted_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }
}

pub struct FakeBackend {
    mounts: Arc<FakeMountTable>,
    next_pid: AtomicU32,
    running: Mutex<HashMap<u32, PathBuf>>,
    spawned: Mutex<Vec<MountSpec>>,
    terminated: Mutex<Vec<ProcessHandle>>,
    failing_terminate: Mutex<HashSet<u32>>,
    probes: Mutex<VecDeque<bool>>,
    probe_count: AtomicUsize,
    listed_with: Mutex<Vec<String>>,
    fail_spawn: AtomicBool,
    never_ready: AtomicBool,
}

impl FakeBackend {
    pub fn new(mounts: Arc<FakeMountTable>) -> Self {
        Self {
            mounts,
            next_pid: AtomicU32::new(1000),
            running: Mutex::new(HashMap::new()),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            failing_terminate: Mutex::new(HashSet::new()),
            probes: Mutex::new(VecDeque::new()),
            probe_count: AtomicUsize::new(0),
            listed_with: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
            never_ready: AtomicBool::new(false),
        }
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Spawned processes never show up in the mount table
    pub fn never_ready(&self, never: bool) {
        self.never_ready.store(never, Ordering::SeqCst);
    }

    pub fn fail_terminate_for(&self, handle: ProcessHandle) {
        self.failing_terminate.lock().insert(handle.pid());
    }

    pub fn allow_terminate(&self, handle: ProcessHandle) {
        self.failing_terminate.lock().remove(&handle.pid());
    }

    /// Queue probe outcomes; an empty queue answers healthy
    pub fn script_probes(&self, outcomes: &[bool]) {
        self.probes.lock().extend(outcomes.iter().copied());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn last_spec(&self) -> Option<MountSpec> {
        self.spawned.lock().last().cloned()
    }

    pub fn spawned_letters(&self) -> Vec<char> {
        self.spawned
            .lock()
            .iter()
            .map(|spec| spec.mount_point.letter)
            .collect()
    }

    pub fn terminated(&self) -> Vec<ProcessHandle> {
        self.terminated.lock().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn listed_with(&self) -> Vec<String> {
        self.listed_with.lock().clone()
    }
}

#[async_trait]
impl MountBackend for FakeBackend {
    async fn spawn(&self, spec: &MountSpec) -> Result<MountProcess, MountError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(MountError::Spawn("rclone not found".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if !self.never_ready.load(Ordering::SeqCst) {
            self.mounts.mount(spec.mount_point.path.clone());
        }
        self.running.lock().insert(pid, spec.mount_point.path.clone());
        self.spawned.lock().push(spec.clone());

        Ok(MountProcess {
            handle: ProcessHandle(pid),
            control_port: 40000 + (pid % 1000) as u16,
        })
    }

    async fn probe(&self, _control_port: u16, timeout: Duration) -> Result<(), MountError> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        match self.probes.lock().pop_front() {
            Some(false) => Err(MountError::ProbeTimeout(timeout)),
            _ => Ok(()),
        }
    }

    async fn terminate(&self, handle: ProcessHandle) -> Result<(), MountError> {
        self.terminated.lock().push(handle);
        if self.failing_terminate.lock().contains(&handle.pid()) {
            return Err(MountError::Terminate {
                pid: handle.pid(),
                reason: "still running".into(),
            });
        }
        let path = self
            .running
            .lock()
            .remove(&handle.pid())
            .ok_or(MountError::UnknownProcess(handle.pid()))?;
        self.mounts.unmount(&path);
        Ok(())
    }

    async fn list_dir(
        &self,
        _config: &ConnectionConfig,
        password: &str,
        _timeout: Duration,
    ) -> Result<Vec<String>, MountError> {
        self.listed_with.lock().push(password.to_string());
        Ok(vec!["docs/".into(), "readme.txt".into()])
    }
}

// ============================================================================
// Frontend
// ============================================================================

#[derive(Default)]
pub struct RecordingFrontend {
    answer: Mutex<Option<String>>,
    prompts: AtomicUsize,
    fail_close: AtomicBool,
    closed: Mutex<Vec<PathBuf>>,
    lost: Mutex<Vec<String>>,
}

impl RecordingFrontend {
    pub fn answer_prompts_with(&self, password: &str) {
        *self.answer.lock() = Some(password.to_string());
    }

    pub fn fail_editor_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn closed_paths(&self) -> Vec<PathBuf> {
        self.closed.lock().clone()
    }

    pub fn lost(&self) -> Vec<String> {
        self.lost.lock().clone()
    }
}

#[async_trait]
impl FrontendHooks for RecordingFrontend {
    async fn prompt_password(&self, _config: &ConnectionConfig) -> Option<String> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().clone()
    }

    async fn close_editors_under(&self, mount_path: &std::path::Path) -> Result<(), String> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err("editor refused to close".into());
        }
        self.closed.lock().push(mount_path.to_path_buf());
        Ok(())
    }

    async fn connection_lost(&self, name: &str, _reason: &str) {
        self.lost.lock().push(name.to_string());
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub registry: Arc<ConnectionRegistry>,
    pub project: Arc<MemoryStore>,
    pub global: Arc<MemoryStore>,
    pub vault: Arc<SpyVault>,
    pub backend: Arc<FakeBackend>,
    pub mounts: Arc<FakeMountTable>,
    pub frontend: Arc<RecordingFrontend>,
    _dir: TempDir,
}

impl Harness {
    /// Add a project-scope connection with an embedded password
    pub async fn add_with_password(&self, name: &str, password: &str) {
        let mut config = sample(name);
        config.password = Some(password.to_string());
        self.registry
            .add_connection(config, Some(Scope::Project))
            .await
            .unwrap();
    }
}

fn build(with_project: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(MemoryStore::new(Scope::Project));
    let global = Arc::new(MemoryStore::new(Scope::Global));
    let vault = Arc::new(SpyVault::default());
    let mounts = Arc::new(FakeMountTable::default());
    let backend = Arc::new(FakeBackend::new(mounts.clone()));
    let frontend = Arc::new(RecordingFrontend::default());

    let options = RegistryOptions {
        mount_root: dir.path().join("mnt"),
        mount_timeout_secs: 2,
        mount_poll_interval_ms: 50,
        ..RegistryOptions::default()
    };

    let mut builder = ConnectionRegistry::builder()
        .global_store(global.clone())
        .vault(vault.clone())
        .backend(backend.clone())
        .mount_table(mounts.clone())
        .frontend(frontend.clone())
        .options(options);
    if with_project {
        builder = builder.project_store(project.clone());
    }

    Harness {
        registry: builder.build().unwrap(),
        project,
        global,
        vault,
        backend,
        mounts,
        frontend,
        _dir: dir,
    }
}

pub fn harness() -> Harness {
    build(true)
}

pub fn harness_without_project() -> Harness {
    build(false)
}
