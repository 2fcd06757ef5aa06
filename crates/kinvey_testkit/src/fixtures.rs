//! Test fixtures and cache helpers.
//!
//! Provides throwaway caches and entity builders whose `_kmd` timestamps
//! are deterministic, so tests can reason about "newer" and "older".

use chrono::{DateTime, Duration, TimeZone, Utc};
use kinvey_cache::{format_timestamp, CacheConfig, CacheStore, Entity, Metadata};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A test cache with automatic cleanup.
pub struct TestCache {
    /// The cache instance.
    pub cache: CacheStore,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestCache {
    /// Creates a new in-memory test cache.
    pub fn memory() -> Self {
        Self {
            cache: CacheStore::open_in_memory().expect("Failed to open in-memory cache"),
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test cache in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cache = CacheStore::open(&temp_dir.path().join("cache"), CacheConfig::default())
            .expect("Failed to open file cache");
        Self {
            cache,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the cache directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("cache"))
    }

    /// Closes and reopens a file-based cache, keeping its directory.
    ///
    /// In-memory caches are returned unchanged.
    pub fn reopen(self) -> Self {
        let Some(path) = self.path() else {
            return self;
        };
        let Self { cache, _temp_dir } = self;
        drop(cache);
        let cache =
            CacheStore::open(&path, CacheConfig::default()).expect("Failed to reopen file cache");
        Self { cache, _temp_dir }
    }
}

impl std::ops::Deref for TestCache {
    type Target = CacheStore;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

/// Runs a test with a temporary in-memory cache.
///
/// # Example
///
/// ```rust,ignore
/// use kinvey_testkit::with_temp_cache;
///
/// #[test]
/// fn my_test() {
///     with_temp_cache(|cache| {
///         let books = cache.collection("books");
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_cache<F, R>(f: F) -> R
where
    F: FnOnce(&CacheStore) -> R,
{
    let test_cache = TestCache::memory();
    f(&test_cache.cache)
}

/// Runs a test with a temporary file-based cache.
pub fn with_file_cache<F, R>(f: F) -> R
where
    F: FnOnce(&CacheStore, &Path) -> R,
{
    let test_cache = TestCache::file();
    let path = test_cache.path().expect("File cache should have a path");
    f(&test_cache.cache, &path)
}

/// The fixed instant all fixture timestamps count from: 2024-01-01T00:00:00Z.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixture epoch")
}

/// The instant `seconds` after [`epoch`].
pub fn at(seconds: i64) -> DateTime<Utc> {
    epoch() + Duration::seconds(seconds)
}

/// `_kmd.lmt` string for the instant `seconds` after [`epoch`].
pub fn lmt(seconds: i64) -> String {
    format_timestamp(at(seconds))
}

/// Builds an entity with `_id`, `_kmd.lmt` at `seconds` past [`epoch`],
/// and the fields of `body` (which must be a JSON object).
pub fn entity(id: &str, seconds: i64, body: Value) -> Entity {
    let mut entity = Entity::with_id(id);
    if let Value::Object(fields) = body {
        for (name, value) in fields {
            entity.set(name, value);
        }
    }
    entity.set_metadata(&Metadata::created_at(at(seconds)));
    entity
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// Creates a cache whose `collection` holds `count` entities with ids
    /// `"0"..count`, each modified at its index in seconds.
    pub fn populated_cache(collection: &str, count: usize) -> TestCache {
        let test_cache = TestCache::memory();
        let entities = (0..count).map(|i| {
            let seconds = i64::try_from(i).expect("fixture size fits i64");
            entity(&i.to_string(), seconds, json!({ "index": i }))
        });
        test_cache
            .collection(collection)
            .save_all(entities)
            .expect("Failed to populate cache");
        test_cache
    }
}
