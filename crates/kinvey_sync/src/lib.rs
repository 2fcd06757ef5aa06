//! # Kinvey Sync
//!
//! Offline-first data stores over a [`kinvey_cache`] cache and a Kinvey
//! app-data backend.
//!
//! This crate provides:
//! - [`DataStore`] handles whose reads and writes follow a [`StoreType`]'s
//!   cache and network policies
//! - Pull with server-computed or client-computed delta sets, full and
//!   auto-paginated fetches, and fallbacks between them
//! - Push, sync and purge of the pending-operation queue
//! - A [`NetworkService`] abstraction with an HTTP implementation over any
//!   [`HttpClient`] and an in-memory [`mock::MockBackend`]
//!
//! ## Key Invariants
//!
//! - A pull writes its records, deletions and checkpoint in one commit,
//!   after all network I/O succeeded
//! - A checkpoint's time is the server time of the request that began the
//!   pull, never a later page's
//! - Pull never overwrites or removes an entity with a pending operation
//! - At most one pull runs per (collection, query, projection)
//!
//! ## Example
//!
//! ```rust
//! use kinvey_cache::{CacheStore, Entity, Query};
//! use kinvey_sync::mock::MockBackend;
//! use kinvey_sync::{Client, Options, StoreType, SyncConfig};
//!
//! # tokio_test_block(async {
//! let client = Client::new(
//!     CacheStore::open_in_memory().unwrap(),
//!     MockBackend::new(),
//!     SyncConfig::default(),
//! );
//! let books = client.data_store("books", StoreType::Sync);
//!
//! let mut saved = None;
//! books
//!     .save(Entity::new().with("title", "Dune"), &Options::default(), |d| {
//!         saved = Some(d.result)
//!     })
//!     .await;
//! assert!(saved.unwrap().unwrap().is_temporary());
//!
//! let outcome = books.sync(&Query::new(), &Options::default()).await.unwrap();
//! assert_eq!(outcome.pushed, 1);
//! assert_eq!(outcome.entities.len(), 1);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread()
//! #         .enable_all()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod delta;
mod error;
mod http;
pub mod mock;
mod network;
mod options;
mod pull;
mod push;
mod store;

pub use client::Client;
pub use config::{SyncConfig, DEFAULT_MAX_IDS_PER_QUERY, DEFAULT_PAGE_SIZE};
pub use delta::{compute_delta_set, DeltaSet};
pub use error::{ServerErrorKind, SyncError, SyncResult};
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, KinveyHttpService, REQUEST_START_HEADER,
};
pub use network::{DeltaResponse, FetchResponse, NetworkService};
pub use options::{Options, OptionsBuilder, ReadPolicy, StoreType, WritePolicy};
pub use push::{PushFailure, PushOutcome, SyncOutcome};
pub use store::{DataStore, Delivery, Source};
