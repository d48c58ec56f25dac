//! Tracked file sync status
//!
//! A tracked file pairs a path in the local workspace with a path on a
//! remote drive. Its status is recomputed from size and modification time
//! every time it is queried; nothing is cached.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// FTP servers report modification times with whole-second (often
/// two-second) resolution
const MTIME_TOLERANCE_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFile {
    /// Relative to the remote root
    pub remote_path: String,
    /// Relative to the workspace root
    pub local_path: String,
}

/// Size and modification time of one side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStamp {
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    InSync,
    LocalNewer,
    RemoteNewer,
    LocalOnly,
    RemoteOnly,
    /// Neither side exists
    Missing,
}

/// Compare both sides
pub fn sync_status(local: Option<FileStamp>, remote: Option<FileStamp>) -> SyncStatus {
    match (local, remote) {
        (None, None) => SyncStatus::Missing,
        (Some(_), None) => SyncStatus::LocalOnly,
        (None, Some(_)) => SyncStatus::RemoteOnly,
        (Some(local), Some(remote)) => {
            let skew = local.mtime.abs_diff(remote.mtime);
            if skew <= MTIME_TOLERANCE_SECS {
                if local.size == remote.size {
                    SyncStatus::InSync
                } else if local.mtime >= remote.mtime {
                    // Same second, different content: assume the local edit
                    SyncStatus::LocalNewer
                } else {
                    SyncStatus::RemoteNewer
                }
            } else if local.mtime > remote.mtime {
                SyncStatus::LocalNewer
            } else {
                SyncStatus::RemoteNewer
            }
        }
    }
}

/// Stat a regular file; `None` when it does not exist or is a directory
pub async fn stamp(path: &Path) -> std::io::Result<Option<FileStamp>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(Some(FileStamp {
        size: metadata.len(),
        mtime,
    }))
}

/// Join a relative path under `root`, refusing anything that climbs out
pub(crate) fn join_relative(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative.trim_start_matches(['/', '\\'])).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

impl TrackedFile {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        }
    }

    /// Current status, reading the remote side through its local mount
    pub async fn status(
        &self,
        workspace_root: &Path,
        mount_root: &Path,
    ) -> std::io::Result<SyncStatus> {
        let invalid = |p: &str| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path escapes its root: {}", p),
            )
        };
        let local = join_relative(workspace_root, &self.local_path)
            .ok_or_else(|| invalid(&self.local_path))?;
        let remote = join_relative(mount_root, &self.remote_path)
            .ok_or_else(|| invalid(&self.remote_path))?;

        let status = sync_status(stamp(&local).await?, stamp(&remote).await?);
        tracing::debug!(
            "Sync status {} <-> {}: {:?}",
            self.local_path,
            self.remote_path,
            status
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(size: u64, mtime: u64) -> Option<FileStamp> {
        Some(FileStamp { size, mtime })
    }

    #[test]
    fn test_presence() {
        assert_eq!(sync_status(None, None), SyncStatus::Missing);
        assert_eq!(sync_status(at(1, 10), None), SyncStatus::LocalOnly);
        assert_eq!(sync_status(None, at(1, 10)), SyncStatus::RemoteOnly);
    }

    #[test]
    fn test_mtime_tolerance() {
        assert_eq!(sync_status(at(5, 100), at(5, 101)), SyncStatus::InSync);
        assert_eq!(sync_status(at(5, 102), at(5, 100)), SyncStatus::InSync);
        assert_eq!(sync_status(at(5, 200), at(5, 100)), SyncStatus::LocalNewer);
        assert_eq!(sync_status(at(5, 100), at(5, 200)), SyncStatus::RemoteNewer);
    }

    #[test]
    fn test_size_mismatch_within_tolerance() {
        assert_eq!(sync_status(at(5, 100), at(6, 100)), SyncStatus::LocalNewer);
        assert_eq!(sync_status(at(5, 99), at(6, 100)), SyncStatus::RemoteNewer);
    }

    #[tokio::test]
    async fn test_status_from_disk() {
        let workspace = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("src")).unwrap();
        std::fs::write(workspace.path().join("src/app.js"), "let a = 1;").unwrap();

        let file = TrackedFile::new("/www/app.js", "src/app.js");
        assert_eq!(
            file.status(workspace.path(), mount.path()).await.unwrap(),
            SyncStatus::LocalOnly
        );

        std::fs::create_dir_all(mount.path().join("www")).unwrap();
        std::fs::copy(
            workspace.path().join("src/app.js"),
            mount.path().join("www/app.js"),
        )
        .unwrap();
        assert_eq!(
            file.status(workspace.path(), mount.path()).await.unwrap(),
            SyncStatus::InSync
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let root = tempfile::tempdir().unwrap();
        let file = TrackedFile::new("../secret", "a.txt");
        assert!(file.status(root.path(), root.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(stamp(root.path()).await.unwrap(), None);
    }
}
