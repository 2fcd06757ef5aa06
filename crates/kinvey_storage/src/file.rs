//! Journal file backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Extension of the staging file written during [`FileBackend::replace`].
const STAGING_SUFFIX: &str = ".compact";

#[derive(Debug)]
struct Handle {
    file: File,
    /// Cached file length; every write path goes through this handle.
    len: u64,
}

/// The cache journal as one OS file.
///
/// `flush` pushes buffered bytes to the OS and `sync` fsyncs them.
/// `replace` stages the new content in a sibling file, fsyncs it, then
/// renames it over the journal. A crash during compaction therefore leaves
/// either the old journal or the new one.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    handle: Mutex<Handle>,
}

impl FileBackend {
    /// Opens the journal at `path`, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = open_rw(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            handle: Mutex::new(Handle { file, len }),
        })
    }

    /// Like [`open`](Self::open), but creates missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Location of the journal.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(STAGING_SUFFIX);
        PathBuf::from(name)
    }
}

fn open_rw(path: &Path) -> StorageResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut handle = self.handle.lock();
        let in_bounds = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= handle.len);
        if !in_bounds {
            return Err(StorageError::OutOfBounds {
                offset,
                len,
                size: handle.len,
            });
        }

        let mut bytes = vec![0u8; len];
        if len > 0 {
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.read_exact(&mut bytes)?;
        }
        Ok(bytes)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let handle = self.handle.get_mut();
        let offset = handle.len;
        if !data.is_empty() {
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(data)?;
            handle.len += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.handle.get_mut().file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.handle.get_mut().file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.handle.lock().len)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        if new_size > handle.len {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: handle.len,
            });
        }
        handle.file.set_len(new_size)?;
        handle.file.sync_all()?;
        handle.len = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let staging = self.staging_path();
        let mut staged = File::create(&staging)?;
        staged.write_all(data)?;
        staged.sync_all()?;
        drop(staged);

        fs::rename(&staging, &self.path)?;
        let file = open_rw(&self.path)?;
        *self.handle.get_mut() = Handle {
            file,
            len: data.len() as u64,
        };
        Ok(())
    }
}
