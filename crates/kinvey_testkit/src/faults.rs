//! Fault injection for storage backends.
//!
//! [`FlakyBackend`] wraps a real backend and fails writes on demand. The
//! cache takes ownership of its backend, so the failure controls live in a
//! shared [`FaultSwitch`] that the test keeps.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (backend, switch) = FlakyBackend::wrap(Box::new(InMemoryBackend::new()));
//! let cache = CacheStore::open_with_backend(Box::new(backend), CacheConfig::default())?;
//!
//! switch.fail_after(10);
//! assert!(cache.collection("books").save(entity("b1", 1, json!({}))).is_err());
//! ```

use kinvey_storage::{StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared failure controls for a [`FlakyBackend`].
#[derive(Debug)]
pub struct FaultSwitch {
    fail_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    tripped: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl FaultSwitch {
    fn new() -> Self {
        Self {
            fail_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Lets `bytes` more bytes through, then fails appends.
    ///
    /// The append that crosses the limit writes its prefix before failing,
    /// leaving a torn record behind.
    pub fn fail_after(&self, bytes: usize) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.fail_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether `flush` and `sync` fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears every injected failure.
    pub fn reset(&self) {
        self.fail_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Whether an injected failure has fired.
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self, what: &str) -> StorageError {
        self.tripped.store(true, Ordering::SeqCst);
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected failure during {what}"),
        ))
    }
}

/// A storage backend wrapper that fails on command.
pub struct FlakyBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<FaultSwitch>,
}

impl FlakyBackend {
    /// Wraps `inner`, returning the backend and its failure controls.
    pub fn wrap(inner: Box<dyn StorageBackend>) -> (Self, Arc<FaultSwitch>) {
        let switch = Arc::new(FaultSwitch::new());
        let backend = Self {
            inner,
            switch: Arc::clone(&switch),
        };
        (backend, switch)
    }
}

impl StorageBackend for FlakyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let switch = &self.switch;
        let current = switch.bytes_written.load(Ordering::SeqCst);
        let limit = switch.fail_after_bytes.load(Ordering::SeqCst);

        if current >= limit {
            return Err(switch.trip("append"));
        }
        if current + data.len() > limit {
            let partial = limit - current;
            let _ = self.inner.append(&data[..partial]);
            switch.bytes_written.fetch_add(partial, Ordering::SeqCst);
            return Err(switch.trip("partial append"));
        }

        switch.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.switch.trip("flush"));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.switch.trip("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.switch.trip("replace"));
        }
        self.inner.replace(data)
    }
}
