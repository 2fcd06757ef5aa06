//! # Kinvey Storage
//!
//! Byte-store backends underneath the offline cache.
//!
//! The cache persists itself as a journal of framed commit records. This
//! crate only knows how to keep those bytes: it never interprets them.
//!
//! ## Design Principles
//!
//! - Backends are append-only byte stores with whole-content replacement
//! - No knowledge of journal framing, entities, or checkpoints
//! - Must be `Send + Sync` so a cache can be shared across tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Shared in-process bytes, for tests and ephemeral caches
//! - [`FileBackend`] - A single OS file, for persistent caches
//!
//! ## Example
//!
//! ```rust
//! use kinvey_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"commit-1").unwrap();
//! backend.replace(b"snapshot").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"snapshot");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
