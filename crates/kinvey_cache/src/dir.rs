//! Cache directory management.
//!
//! ```text
//! cache_dir/
//! ├─ LOCK            # Advisory lock, one process at a time
//! └─ cache.journal   # Commit journal
//! ```

use crate::error::{CacheError, CacheResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "cache.journal";

/// An exclusively locked cache directory.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub(crate) struct CacheDir {
    path: PathBuf,
    lock_file: File,
}

impl CacheDir {
    /// Opens (and optionally creates) the directory and takes its lock.
    pub fn open(path: &Path, create_if_missing: bool) -> CacheResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CacheError::NotFound {
                    path: path.display().to_string(),
                });
            }
            fs::create_dir_all(path)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CacheError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_file,
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }
}

impl Drop for CacheDir {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_directory_and_lock() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cache");

        let dir = CacheDir::open(&path, true).unwrap();
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.journal_path(), path.join(JOURNAL_FILE));
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = CacheDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CacheError::NotFound { .. })));
    }

    #[test]
    fn second_open_is_locked_until_drop() {
        let temp = tempdir().unwrap();
        let first = CacheDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            CacheDir::open(temp.path(), true),
            Err(CacheError::Locked)
        ));

        drop(first);
        assert!(CacheDir::open(temp.path(), true).is_ok());
    }
}
