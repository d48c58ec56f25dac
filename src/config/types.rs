//! Connection Definitions
//!
//! The persisted shape of a remote drive connection. Both the project file
//! and the global settings store serialize the same camelCase structure.

use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize};

/// Remote protocol spoken by the mount backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain FTP
    #[default]
    Ftp,
    /// FTP over TLS
    Ftps,
    /// SSH file transfer
    Sftp,
}

impl Protocol {
    /// Well-known port used when the config leaves `port` unset
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp => 22,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
        }
    }
}

/// VFS cache mode handed to the mount backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Off,
    Minimal,
    #[default]
    Writes,
    Full,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Off => "off",
            CacheMode::Minimal => "minimal",
            CacheMode::Writes => "writes",
            CacheMode::Full => "full",
        }
    }
}

/// Which persistence backend owns a connection definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Project,
    Global,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Project => write!(f, "project"),
            Scope::Global => write!(f, "global"),
        }
    }
}

/// Where the password for a connection currently comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PasswordSource {
    Vault,
    ProjectFile,
    #[default]
    None,
}

/// A saved remote drive connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Unique, user-chosen key
    pub name: String,
    pub host: String,
    /// 0 means "protocol default"
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub username: String,
    /// Directory on the server that becomes the drive root
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Pinned drive letter; allocated automatically when absent
    #[serde(
        default,
        deserialize_with = "deserialize_drive_letter",
        skip_serializing_if = "Option::is_none"
    )]
    pub drive_letter: Option<char>,
    /// Use explicit (AUTH TLS) instead of implicit FTPS
    #[serde(default)]
    pub explicit_tls: bool,
    #[serde(default)]
    pub ignore_cert_errors: bool,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub cache_mode: CacheMode,
    /// Idle connection timeout, in the backend's duration syntax ("5m", "30s")
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
    /// Directory listing refresh interval in seconds, 0 disables it
    #[serde(default)]
    pub refresh_interval: u64,
    /// Plaintext password; only honored in the project file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_idle_timeout() -> String {
    "5m".to_string()
}

/// Hand-edited files write drive letters as "Q", "Q:" or "Q:\"
fn deserialize_drive_letter<'de, D>(deserializer: D) -> Result<Option<char>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let letter = raw
        .trim()
        .trim_end_matches(['\\', '/'])
        .trim_end_matches(':');
    if letter.is_empty() {
        return Ok(None);
    }

    let mut chars = letter.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(Some(c)),
        _ => Err(de::Error::invalid_value(
            Unexpected::Str(&raw),
            &"a drive letter such as \"Q\" or \"Q:\"",
        )),
    }
}

/// Validation errors for a connection definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Connection name must not be empty")]
    EmptyName,

    #[error("Host must not be empty for connection '{0}'")]
    EmptyHost(String),

    #[error("Drive letter '{letter}' for connection '{name}' is not an assignable letter")]
    InvalidDriveLetter { name: String, letter: char },

    #[error("Invalid idle timeout '{value}' for connection '{name}'")]
    InvalidIdleTimeout { name: String, value: String },
}

impl ConnectionConfig {
    /// Create a config with defaults for everything but the address
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: 0,
            protocol,
            username: username.into(),
            remote_path: default_remote_path(),
            drive_letter: None,
            explicit_tls: false,
            ignore_cert_errors: false,
            auto_connect: false,
            cache_mode: CacheMode::default(),
            idle_timeout: default_idle_timeout(),
            refresh_interval: 0,
            password: None,
        }
    }

    /// Port to dial, falling back to the protocol default
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.protocol.default_port()
        } else {
            self.port
        }
    }

    /// Password embedded in the definition, ignoring empty strings
    pub fn embedded_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Copy of this config with the embedded password removed
    pub fn without_password(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigValidationError::EmptyName);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigValidationError::EmptyHost(self.name.clone()));
        }
        if let Some(letter) = self.drive_letter {
            if !crate::mount::drive::is_assignable(letter) {
                return Err(ConfigValidationError::InvalidDriveLetter {
                    name: self.name.clone(),
                    letter,
                });
            }
        }
        if !is_duration(&self.idle_timeout) {
            return Err(ConfigValidationError::InvalidIdleTimeout {
                name: self.name.clone(),
                value: self.idle_timeout.clone(),
            });
        }
        Ok(())
    }
}

/// Accepts backend duration strings such as "90s", "5m", "1h30m" or a bare "0"
fn is_duration(value: &str) -> bool {
    if value == "0" {
        return true;
    }
    let mut saw_digit = false;
    let mut saw_unit = false;
    for c in value.chars() {
        if c.is_ascii_digit() {
            saw_digit = true;
            saw_unit = false;
        } else if matches!(c, 'h' | 'm' | 's') && saw_digit {
            saw_unit = true;
            saw_digit = false;
        } else {
            return false;
        }
    }
    saw_unit && !saw_digit
}

/// Project-scope file layout: `{ "connections": [...] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Deserialize)]
struct RawProjectFile {
    #[serde(default)]
    connections: Vec<serde_json::Value>,
}

impl ProjectFile {
    /// Parse a project file, skipping entries that do not deserialize.
    ///
    /// Returns the file and how many entries were skipped. Only a document
    /// that is not a `{ "connections": [...] }` object is an error.
    pub fn parse(contents: &str) -> Result<(Self, usize), serde_json::Error> {
        let raw: RawProjectFile = serde_json::from_str(contents)?;

        let mut skipped = 0;
        let mut connections = Vec::with_capacity(raw.connections.len());
        for (index, value) in raw.connections.into_iter().enumerate() {
            match serde_json::from_value::<ConnectionConfig>(value) {
                Ok(config) => connections.push(config),
                Err(e) => {
                    tracing::warn!("Skipping connection #{} in project file: {}", index, e);
                    skipped += 1;
                }
            }
        }

        Ok((Self { connections }, skipped))
    }
}
