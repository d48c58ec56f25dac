//! Configuration Management Module
//!
//! Handles persistent storage of connection definitions in the project and
//! global scopes, scope merging, and password storage in the system keychain.

pub mod keychain;
pub mod resolve;
pub mod storage;
pub mod types;

pub use keychain::{vault_key, CredentialVault, Keychain, KeychainError, MemoryVault};
pub use resolve::{merge_by_name, password_source, split_password};
pub use storage::{
    config_dir, default_mount_root, settings_file, ConfigBackend, GlobalConfigStore,
    ProjectConfigStore, StorageError,
};
pub use types::{
    CacheMode, ConfigValidationError, ConnectionConfig, PasswordSource, ProjectFile, Protocol,
    Scope,
};
