//! Error types for the cache store.

use std::io;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] kinvey_storage::StorageError),

    /// I/O error outside the storage backend (directory, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the record in the journal.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// The journal is structurally invalid.
    #[error("journal corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The journal was written by an unknown format version.
    #[error("unsupported journal version {version}")]
    UnsupportedVersion {
        /// Version found in the record header.
        version: u16,
    },

    /// A record payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// An entity is malformed (not an object, missing or invalid id).
    #[error("invalid entity: {message}")]
    InvalidEntity {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the cache directory.
    #[error("cache locked: another process has exclusive access")]
    Locked,

    /// The cache directory does not exist and creation was disabled.
    #[error("cache not found at {path}")]
    NotFound {
        /// Path that was looked up.
        path: String,
    },
}

impl CacheError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an invalid entity error.
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }
}
