//! Keychain Integration
//!
//! Stores connection passwords keyed by connection name. The system keychain
//! implementation uses the `keyring` crate; [`MemoryVault`] keeps secrets in
//! process memory for headless use and tests.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::RwLock;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.remotedrive.ftp";

/// Prefix prepended to the connection name to form the vault key
pub const VAULT_KEY_PREFIX: &str = "remotedrive.password.";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain verification failed for {0}")]
    VerificationFailed(String),
}

/// Vault key for a connection name
pub fn vault_key(connection_name: &str) -> String {
    format!("{}{}", VAULT_KEY_PREFIX, connection_name)
}

/// Secret storage keyed by connection name
pub trait CredentialVault: Send + Sync {
    /// `Ok(None)` when no secret is stored
    fn get(&self, connection_name: &str) -> Result<Option<String>, KeychainError>;

    fn store(&self, connection_name: &str, secret: &str) -> Result<(), KeychainError>;

    /// Deleting a missing entry is not an error
    fn delete(&self, connection_name: &str) -> Result<(), KeychainError>;

    /// Move a secret to a new name, returns whether anything was moved
    fn rename(&self, old_name: &str, new_name: &str) -> Result<bool, KeychainError> {
        match self.get(old_name)? {
            Some(secret) => {
                self.store(new_name, &secret)?;
                self.delete(old_name)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// System keychain backed vault
pub struct Keychain {
    service: String,
}

impl Keychain {
    /// Create a new keychain manager
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Use explicit username to ensure stable keychain identity on macOS
    fn entry(&self, connection_name: &str) -> Result<Entry, KeychainError> {
        let username = whoami::username();
        let account = format!("{}@{}", username, vault_key(connection_name));
        Ok(Entry::new(&self.service, &account)?)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVault for Keychain {
    fn get(&self, connection_name: &str) -> Result<Option<String>, KeychainError> {
        let entry = self.entry(connection_name)?;
        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!("Keychain get success: connection={}", connection_name);
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                tracing::error!(
                    "Keychain get failed: connection={}, error={:?}",
                    connection_name,
                    e
                );
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn store(&self, connection_name: &str, secret: &str) -> Result<(), KeychainError> {
        tracing::info!(
            "Keychain store: service={}, connection={}",
            self.service,
            connection_name
        );
        let entry = self.entry(connection_name)?;
        entry.set_password(secret)?;

        // Verify the store actually worked by reading it back
        match entry.get_password() {
            Ok(read_back) if read_back == secret => Ok(()),
            Ok(_) => {
                tracing::error!("Keychain store verification failed: content mismatch");
                Err(KeychainError::VerificationFailed(connection_name.to_string()))
            }
            Err(e) => {
                tracing::error!("Keychain store verification failed: {:?}", e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn delete(&self, connection_name: &str) -> Result<(), KeychainError> {
        let entry = self.entry(connection_name)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

/// In-process vault, keyed the same way as the keychain
#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

impl CredentialVault for MemoryVault {
    fn get(&self, connection_name: &str) -> Result<Option<String>, KeychainError> {
        Ok(self.secrets.read().get(&vault_key(connection_name)).cloned())
    }

    fn store(&self, connection_name: &str, secret: &str) -> Result<(), KeychainError> {
        self.secrets
            .write()
            .insert(vault_key(connection_name), secret.to_string());
        Ok(())
    }

    fn delete(&self, connection_name: &str) -> Result<(), KeychainError> {
        self.secrets.write().remove(&vault_key(connection_name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: This test interacts with the real system keychain
    // It uses a unique service name to avoid conflicts

    #[test]
    #[ignore] // Run manually: cargo test keychain -- --ignored
    fn test_keychain_operations() {
        let keychain = Keychain::with_service("com.remotedrive.test");

        keychain.store("staging", "test-secret").unwrap();
        assert_eq!(keychain.get("staging").unwrap().as_deref(), Some("test-secret"));

        assert!(keychain.rename("staging", "staging-eu").unwrap());
        assert_eq!(keychain.get("staging").unwrap(), None);

        keychain.delete("staging-eu").unwrap();
        assert_eq!(keychain.get("staging-eu").unwrap(), None);
    }

    #[test]
    fn test_vault_key() {
        assert_eq!(vault_key("prod"), "remotedrive.password.prod");
    }

    #[test]
    fn test_memory_vault_rename() {
        let vault = MemoryVault::new();
        vault.store("old", "pw").unwrap();

        assert!(vault.rename("old", "new").unwrap());
        assert_eq!(vault.get("old").unwrap(), None);
        assert_eq!(vault.get("new").unwrap().as_deref(), Some("pw"));

        assert!(!vault.rename("missing", "other").unwrap());
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_memory_vault_delete_missing_is_ok() {
        let vault = MemoryVault::new();
        assert!(vault.delete("nothing").is_ok());
        assert!(vault.is_empty());
    }
}
