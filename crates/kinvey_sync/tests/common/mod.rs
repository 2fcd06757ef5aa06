//! Shared harness for data store integration tests.

#![allow(dead_code)]

use kinvey_cache::{CacheStore, CollectionCache, Entity};
use kinvey_sync::mock::{MockBackend, MockOp};
use kinvey_sync::{Client, DataStore, StoreType, SyncConfig};
use kinvey_testkit::init_tracing;
use std::sync::Arc;

pub const BOOKS: &str = "books";

/// A client over an in-memory cache and a shared mock backend.
pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub client: Client<MockBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let cache = CacheStore::open_in_memory().expect("open cache");
        Self::with_cache(cache, config)
    }

    /// A harness over a cache the test opened itself.
    pub fn with_cache(cache: CacheStore, config: SyncConfig) -> Self {
        init_tracing();
        let backend = Arc::new(MockBackend::new());
        let client = Client::from_shared(Arc::new(cache), Arc::clone(&backend), config);
        Self { backend, client }
    }

    pub fn store(&self, store_type: StoreType) -> DataStore<MockBackend> {
        self.client.data_store(BOOKS, store_type)
    }

    /// The cached side of the books collection.
    pub fn cached(&self) -> CollectionCache<'_> {
        self.client.cache().collection(BOOKS)
    }

    /// Seeds one remote book.
    pub fn seed(&self, title: &str) -> Entity {
        self.backend.seed(BOOKS, book(title))
    }

    /// Seeds `count` remote books titled "Book 0".. with an `index` field.
    pub fn seed_many(&self, count: usize) -> Vec<Entity> {
        (0..count)
            .map(|i| {
                self.backend
                    .seed(BOOKS, book(&format!("Book {i}")).with("index", i))
            })
            .collect()
    }

    pub fn requests_of(&self, op: MockOp) -> usize {
        self.backend.count_of(op)
    }
}

pub fn book(title: &str) -> Entity {
    Entity::new().with("title", title)
}

/// Titles of `entities`, sorted.
pub fn titles(entities: &[Entity]) -> Vec<String> {
    let mut titles: Vec<String> = entities
        .iter()
        .filter_map(|e| e.get("title").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    titles.sort();
    titles
}
