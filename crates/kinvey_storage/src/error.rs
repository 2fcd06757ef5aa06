//! Storage errors.

use std::io;
use thiserror::Error;

/// Result alias for backend calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying file failed.
    #[error("journal I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A read reached past the last written byte.
    #[error("bytes {offset}..+{len} are outside the {size}-byte journal")]
    OutOfBounds {
        /// Start of the read.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Bytes currently stored.
        size: u64,
    },

    /// A truncation would have grown the journal.
    #[error("cannot truncate a {size}-byte journal up to {requested} bytes")]
    TruncateBeyondEnd {
        /// Length asked for.
        requested: u64,
        /// Bytes currently stored.
        size: u64,
    },
}
