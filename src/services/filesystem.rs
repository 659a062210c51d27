//! File-system virtualization.
//!
//! The cloud sees a flat set of virtual directories, each mapped onto a local
//! directory. The table is fixed-capacity and lives behind the file-system
//! service's Lock.
//!
//! ```text
//!   "/logs/2026/boot.txt" ──resolve──▶ <local_dir of "logs">/2026/boot.txt
//! ```

use std::path::{Component, Path, PathBuf};

use heapless::{String, Vec};

use crate::error::FsError;

pub const MAX_VIRTUAL_DIRS: usize = 8;
pub const MAX_DIR_NAME: usize = 32;

#[derive(Debug, Clone)]
struct VirtualDir {
    name: String<MAX_DIR_NAME>,
    local: PathBuf,
}

/// Mapping of virtual directory names to local directories.
#[derive(Debug, Default)]
pub struct VirtualDirTable {
    dirs: Vec<VirtualDir, MAX_VIRTUAL_DIRS>,
}

/// A virtual directory name is one non-empty path component.
pub fn is_valid_dir_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DIR_NAME
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

impl VirtualDirTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, local_dir: &Path) -> Result<(), FsError> {
        if !is_valid_dir_name(name) || local_dir.as_os_str().is_empty() {
            return Err(FsError::InvalidPath);
        }
        if self.dirs.iter().any(|d| d.name == name) {
            return Err(FsError::AlreadyMapped);
        }
        if !local_dir.is_dir() {
            return Err(FsError::NotADir);
        }
        let mut stored = String::new();
        stored.push_str(name).map_err(|()| FsError::InvalidPath)?;
        self.dirs
            .push(VirtualDir {
                name: stored,
                local: local_dir.to_path_buf(),
            })
            .map_err(|_| FsError::TableFull)
    }

    pub fn remove(&mut self, name: &str) -> Result<(), FsError> {
        if !is_valid_dir_name(name) {
            return Err(FsError::InvalidPath);
        }
        let pos = self
            .dirs
            .iter()
            .position(|d| d.name == name)
            .ok_or(FsError::NotMapped)?;
        self.dirs.swap_remove(pos);
        Ok(())
    }

    /// Map a cloud-side path onto the local file system.
    ///
    /// Returns `None` for unmapped directories and for any path that tries
    /// to leave its directory.
    pub fn resolve(&self, virtual_path: &str) -> Option<PathBuf> {
        let trimmed = virtual_path.trim_start_matches('/');
        let (head, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        let dir = self.dirs.iter().find(|d| d.name == head)?;
        let mut out = dir.local.clone();
        for component in Path::new(rest).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(out)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
