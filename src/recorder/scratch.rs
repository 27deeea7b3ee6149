//! Per-session scratch files
//!
//! A `ScratchFile` owns a uniquely named path under the scratch directory
//! and deletes whatever is there when dropped.

use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory that scratch files are allocated in
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    dir: PathBuf,
}

impl ScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a new unique path with the given extension. The file itself is
    /// created by whoever writes to it.
    pub fn allocate(&self, extension: &str) -> ScratchFile {
        let name = format!(
            "{}{}.{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple(),
            extension
        );
        ScratchFile {
            path: self.dir.join(name),
            released: false,
        }
    }
}

/// Owned scratch path, removed on drop
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    released: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the file now, reporting failure instead of logging it.
    /// A file that was never created counts as removed.
    pub fn remove(mut self) -> io::Result<()> {
        self.released = true;
        remove_if_exists(&self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_if_exists(&self.path) {
            tracing::warn!("Failed to remove scratch file {:?}: {}", self.path, e);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed scratch file {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_allocated_names_are_unique() {
        let dir = tempdir().unwrap();
        let space = ScratchSpace::new(dir.path()).unwrap();

        let a = space.allocate("m4a");
        let b = space.allocate("m4a");
        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().extension().unwrap(), "m4a");
        // Two simple uuids: 64 hex chars
        assert_eq!(a.path().file_stem().unwrap().len(), 64);
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempdir().unwrap();
        let space = ScratchSpace::new(dir.path()).unwrap();

        let file = space.allocate("m4a");
        std::fs::write(file.path(), b"audio").unwrap();
        assert!(file.exists());
        drop(file);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_never_created_is_ok() {
        let dir = tempdir().unwrap();
        let space = ScratchSpace::new(dir.path()).unwrap();
        assert!(space.allocate("m4a").remove().is_ok());
    }

    #[test]
    fn test_creates_missing_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let space = ScratchSpace::new(&nested).unwrap();
        assert!(space.dir().is_dir());
    }
}
