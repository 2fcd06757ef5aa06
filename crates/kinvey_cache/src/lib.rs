//! # Kinvey Cache
//!
//! The device-local half of the offline-first sync engine.
//!
//! This crate provides:
//! - Entity storage per collection, with a small query evaluator
//! - Sync checkpoints keyed by (collection, query, projection)
//! - The pending-operation outbox that push replays
//! - A checksummed commit journal with crash recovery and compaction
//!
//! ## Key Invariants
//!
//! - Every [`CacheStore::write`] commits all of its changes or none
//! - At most one pending operation exists per (collection, id)
//! - A torn journal tail is discarded on open; a checksum mismatch is fatal
//! - One process holds a cache directory at a time
//!
//! ## Example
//!
//! ```rust
//! use kinvey_cache::{CacheStore, Entity, Filter, Query};
//!
//! let cache = CacheStore::open_in_memory().unwrap();
//! let books = cache.collection("books");
//! books.save(Entity::with_id("b1").with("year", 1965)).unwrap();
//!
//! let query = Query::new().filter(Filter::gt("year", 1900));
//! assert_eq!(books.find(&query).len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod dir;
mod entity;
mod error;
mod journal;
mod pending;
mod query;
mod state;
mod store;
mod txn;

pub use checkpoint::{Checkpoint, CheckpointKey};
pub use config::CacheConfig;
pub use entity::{
    format_timestamp, is_temporary_id, parse_timestamp, Acl, Entity, Metadata, ACL_FIELD,
    ID_FIELD, METADATA_FIELD, TEMP_ID_PREFIX,
};
pub use error::{CacheError, CacheResult};
pub use journal::{JOURNAL_MAGIC, JOURNAL_VERSION};
pub use pending::{PendingKind, PendingOperation};
pub use query::{Filter, Query, SortDirection, SortKey};
pub use store::{CacheStore, CollectionCache};
pub use txn::WriteTxn;
