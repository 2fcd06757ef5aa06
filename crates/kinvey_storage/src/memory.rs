//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory byte store.
///
/// Clones share the same bytes. Handing one clone to a cache and keeping
/// another lets a test drop the cache and "reopen" it from what was
/// written, the same way a file-backed cache would be reopened after a
/// restart.
///
/// # Example
///
/// ```rust
/// use kinvey_storage::{InMemoryBackend, StorageBackend};
///
/// let backend = InMemoryBackend::new();
/// let mut writer = backend.clone();
/// writer.append(b"journal").unwrap();
/// assert_eq!(backend.size().unwrap(), 7);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding pre-existing bytes.
    ///
    /// Useful for replaying hand-crafted or corrupted journals.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the current bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrites a single byte in place.
    ///
    /// Lets tests flip bits inside a written record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if `offset` is out of range.
    pub fn corrupt_byte(&self, offset: u64, value: u8) -> StorageResult<()> {
        let mut buf = self.bytes.write();
        let size = buf.len() as u64;
        let slot = usize::try_from(offset)
            .ok()
            .and_then(|i| buf.get_mut(i))
            .ok_or(StorageError::OutOfBounds {
                offset,
                len: 1,
                size,
            })?;
        *slot = value;
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let buf = self.bytes.read();
        let size = buf.len() as u64;
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds {
            offset,
            len,
            size,
        })?;
        let end = start.saturating_add(len);

        buf.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(StorageError::OutOfBounds { offset, len, size })
    }

    fn append(&mut self, chunk: &[u8]) -> StorageResult<u64> {
        let mut buf = self.bytes.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(chunk);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut buf = self.bytes.write();
        let size = buf.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        // new_size <= len, so it fits in usize
        buf.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, snapshot: &[u8]) -> StorageResult<()> {
        *self.bytes.write() = snapshot.to_vec();
        Ok(())
    }
}
