//! Hybrid configuration resolution
//!
//! Merging of the two scopes and derivation of the password source. These
//! are pure functions so the shadowing rules can be tested without disk I/O.

use std::collections::HashSet;

use super::keychain::CredentialVault;
use super::types::{ConnectionConfig, PasswordSource, Scope};

/// Merge project and global definitions by name.
///
/// Project entries are inserted first; a global entry is kept only when no
/// project entry has the same name. Fields are never merged across scopes.
/// Within one scope the first definition of a name wins.
pub fn merge_by_name(
    project: Vec<ConnectionConfig>,
    global: Vec<ConnectionConfig>,
) -> Vec<(ConnectionConfig, Scope)> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(project.len() + global.len());

    let scoped = project
        .into_iter()
        .map(|c| (c, Scope::Project))
        .chain(global.into_iter().map(|c| (c, Scope::Global)));

    for (config, scope) in scoped {
        if config.name.trim().is_empty() {
            tracing::warn!("Skipping {} connection with empty name", scope);
            continue;
        }
        if !seen.insert(config.name.clone()) {
            tracing::debug!(
                "Connection '{}' from {} scope shadowed by an earlier definition",
                config.name,
                scope
            );
            continue;
        }
        merged.push((config, scope));
    }

    merged
}

/// Derive where a connection's password would come from right now.
///
/// The project file is consulted first (only for project scope), then the
/// vault. Vault errors count as "no password".
pub fn password_source(
    config: &ConnectionConfig,
    scope: Scope,
    vault: &dyn CredentialVault,
) -> PasswordSource {
    if scope == Scope::Project && config.embedded_password().is_some() {
        return PasswordSource::ProjectFile;
    }

    match vault.get(&config.name) {
        Ok(Some(_)) => PasswordSource::Vault,
        Ok(None) => PasswordSource::None,
        Err(e) => {
            tracing::warn!("Vault lookup for '{}' failed: {}", config.name, e);
            PasswordSource::None
        }
    }
}

/// Split a config into what the target backend persists and the password
/// that must go to the vault instead.
///
/// Only the project file may hold a plaintext password; for global scope an
/// embedded password is handed back for the vault.
pub fn split_password(
    config: ConnectionConfig,
    scope: Scope,
) -> (ConnectionConfig, Option<String>) {
    match scope {
        Scope::Project => (config, None),
        Scope::Global => {
            let password = config.embedded_password().map(str::to_string);
            (config.without_password(), password)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keychain::MemoryVault;
    use crate::config::types::Protocol;

    fn config(name: &str, host: &str) -> ConnectionConfig {
        ConnectionConfig::new(name, Protocol::Ftp, host, "user")
    }

    #[test]
    fn test_project_shadows_global() {
        let merged = merge_by_name(
            vec![config("shared", "project.example.com")],
            vec![
                config("shared", "global.example.com"),
                config("only-global", "g2"),
            ],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].0.host, "project.example.com");
        assert_eq!(merged[0].1, Scope::Project);
        assert_eq!(merged[1].0.name, "only-global");
        assert_eq!(merged[1].1, Scope::Global);
    }

    #[test]
    fn test_every_shared_name_keeps_project_entry() {
        let names = ["a", "b", "c", "d"];
        let project: Vec<_> = names.iter().map(|n| config(n, "p")).collect();
        let global: Vec<_> = names.iter().rev().map(|n| config(n, "g")).collect();

        let merged = merge_by_name(project, global);
        assert_eq!(merged.len(), names.len());
        assert!(merged
            .iter()
            .all(|(c, scope)| *scope == Scope::Project && c.host == "p"));
    }

    #[test]
    fn test_duplicates_within_scope_and_empty_names() {
        let merged = merge_by_name(
            vec![config("x", "first"), config("x", "second"), config("", "h")],
            vec![],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0.host, "first");
    }

    #[test]
    fn test_password_source_project_file_wins_without_vault() {
        let vault = MemoryVault::new();
        vault.store("a", "from-vault").unwrap();

        let mut c = config("a", "h");
        c.password = Some("x".into());
        assert_eq!(
            password_source(&c, Scope::Project, &vault),
            PasswordSource::ProjectFile
        );
        // Embedded passwords are ignored outside the project scope
        assert_eq!(
            password_source(&c, Scope::Global, &vault),
            PasswordSource::Vault
        );
    }

    #[test]
    fn test_password_source_none() {
        let vault = MemoryVault::new();
        assert_eq!(
            password_source(&config("a", "h"), Scope::Project, &vault),
            PasswordSource::None
        );
    }

    #[test]
    fn test_split_password() {
        let mut c = config("a", "h");
        c.password = Some("pw".into());

        let (stored, vaulted) = split_password(c.clone(), Scope::Project);
        assert_eq!(stored.password.as_deref(), Some("pw"));
        assert!(vaulted.is_none());

        let (stored, vaulted) = split_password(c, Scope::Global);
        assert!(stored.password.is_none());
        assert_eq!(vaulted.as_deref(), Some("pw"));
    }
}
