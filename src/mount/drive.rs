//! Drive letter allocation
//!
//! Mount points are identified by a drive letter from a fixed pool (`C`..=`Z`,
//! `A` and `B` are reserved). On Windows the letter is the mount point itself
//! (`X:`); elsewhere it names a directory under the mount root.
//!
//! Allocation scans the pool backwards from `Z` and takes the first letter
//! that is neither held by this process nor present in the host mount table,
//! so a reconnect of the same connection lands on the same letter whenever it
//! is still free.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Letters reserved for system use
const RESERVED: [char; 2] = ['A', 'B'];

/// Ordered identifier pool, `C` first
pub fn letter_pool() -> impl DoubleEndedIterator<Item = char> {
    ('A'..='Z').filter(|c| !RESERVED.contains(c))
}

/// Whether a letter (any case) may be used as a mount point
pub fn is_assignable(letter: char) -> bool {
    let letter = letter.to_ascii_uppercase();
    letter.is_ascii_uppercase() && !RESERVED.contains(&letter)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriveError {
    #[error("Drive letter {0}: is already in use")]
    LetterInUse(char),

    #[error("Drive letter '{0}' cannot be assigned")]
    NotAssignable(char),

    #[error("No free drive letter available")]
    PoolExhausted,
}

/// A local mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub letter: char,
    pub path: PathBuf,
}

impl MountPoint {
    /// Resolve a letter to its platform path
    pub fn for_letter(letter: char, mount_root: &Path) -> Self {
        let letter = letter.to_ascii_uppercase();
        #[cfg(windows)]
        let path = {
            let _ = mount_root;
            PathBuf::from(format!("{}:", letter))
        };
        #[cfg(not(windows))]
        let path = mount_root.join(letter.to_string());

        Self { letter, path }
    }
}

impl std::fmt::Display for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Pick a letter.
///
/// `held` are letters owned by this process, `host` letters found in the
/// host mount table. A pinned letter is used only if it is free.
pub fn allocate(
    pinned: Option<char>,
    held: &HashSet<char>,
    host: &HashSet<char>,
) -> Result<char, DriveError> {
    let in_use = |c: &char| held.contains(c) || host.contains(c);

    if let Some(letter) = pinned {
        let letter = letter.to_ascii_uppercase();
        if !is_assignable(letter) {
            return Err(DriveError::NotAssignable(letter));
        }
        if in_use(&letter) {
            return Err(DriveError::LetterInUse(letter));
        }
        return Ok(letter);
    }

    letter_pool()
        .rev()
        .find(|c| !in_use(c))
        .ok_or(DriveError::PoolExhausted)
}

/// Letters that appear in a list of host mount paths.
///
/// Recognises both `X:` style roots and `<mount_root>/<X>` directories.
pub fn occupied_letters(mounted: &[PathBuf], mount_root: &Path) -> HashSet<char> {
    mounted
        .iter()
        .filter_map(|path| letter_of(path, mount_root))
        .collect()
}

fn letter_of(path: &Path, mount_root: &Path) -> Option<char> {
    let text = path.to_string_lossy();
    let mut chars = text.chars();
    if let (Some(letter), Some(':')) = (chars.next(), chars.next()) {
        let rest = chars.as_str();
        if letter.is_ascii_alphabetic() && (rest.is_empty() || rest == "\\" || rest == "/") {
            return Some(letter.to_ascii_uppercase());
        }
    }

    if path.parent() == Some(mount_root) {
        let name = path.file_name()?.to_str()?;
        let mut chars = name.chars();
        if let (Some(letter), None) = (chars.next(), chars.next()) {
            if letter.is_ascii_alphabetic() {
                return Some(letter.to_ascii_uppercase());
            }
        }
    }

    None
}

/// View of the host's mount table
pub trait MountTable: Send + Sync {
    /// Paths currently mounted on the host
    fn mounted_paths(&self) -> Vec<PathBuf>;

    /// Whether a mount point is live
    fn is_mounted(&self, mount_point: &MountPoint) -> bool {
        self.mounted_paths()
            .iter()
            .any(|p| same_mount(p, &mount_point.path))
    }
}

fn same_mount(host: &Path, ours: &Path) -> bool {
    if host == ours {
        return true;
    }
    // Windows roots come back as "X:\"
    let host = host.to_string_lossy();
    let ours = ours.to_string_lossy();
    host.trim_end_matches(['\\', '/'])
        .eq_ignore_ascii_case(ours.trim_end_matches(['\\', '/']))
}

/// Mount table read from the operating system
#[derive(Default)]
pub struct SystemMountTable;

impl SystemMountTable {
    pub fn new() -> Self {
        Self
    }
}

impl MountTable for SystemMountTable {
    fn mounted_paths(&self) -> Vec<PathBuf> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .map(|disk| disk.mount_point().to_path_buf())
            .collect()
    }

    fn is_mounted(&self, mount_point: &MountPoint) -> bool {
        // A drive letter only exists once the mount is live
        if cfg!(windows) {
            return mount_point.path.exists();
        }
        self.mounted_paths()
            .iter()
            .any(|p| same_mount(p, &mount_point.path))
    }
}
