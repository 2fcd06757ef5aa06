//! # Kinvey Testkit
//!
//! Test utilities for the Kinvey sync engine crates.
//!
//! This crate provides:
//! - Cache fixtures with automatic cleanup
//! - Entity builders with deterministic `_kmd` timestamps
//! - A fault-injecting storage backend for atomicity tests
//! - Property-based test generators using proptest
//! - One-line tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kinvey_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_cache() {
//!     with_temp_cache(|cache| {
//!         let books = cache.collection("books");
//!         books.save(entity("b1", 1, json!({"title": "Dune"}))).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`. Safe to call from every test; only the first call
/// installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
