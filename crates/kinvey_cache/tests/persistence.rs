//! Durability and atomicity of the cache across reopen and storage faults.

use kinvey_cache::{CacheConfig, CacheError, CacheStore, Filter, PendingKind, Query};
use kinvey_storage::{InMemoryBackend, StorageBackend};
use kinvey_testkit::prelude::*;
use serde_json::json;

fn reopen(backend: &InMemoryBackend) -> CacheStore {
    CacheStore::open_with_backend(Box::new(backend.clone()), CacheConfig::default()).unwrap()
}

#[test]
fn entities_checkpoints_and_pending_survive_reopen() {
    let test_cache = TestCache::file();
    let books = test_cache.collection("books");
    books
        .write(|txn| {
            txn.put(entity("b1", 1, json!({ "title": "Dune" })))?;
            txn.put(entity("tmp_2", 2, json!({ "title": "Emma" })))?;
            txn.record_pending("tmp_2", PendingKind::Create);
            Ok(())
        })
        .unwrap();
    books.set_last_sync(&Query::new(), at(10), None, None).unwrap();

    let reopened = test_cache.reopen();
    let books = reopened.collection("books");
    assert_eq!(books.count(&Query::new()), 2);
    assert_eq!(books.pending("tmp_2"), Some(PendingKind::Create));
    assert_eq!(books.last_sync(&Query::new()), Some(at(10)));
}

#[test]
fn failed_append_rolls_back_whole_batch() {
    let shared = InMemoryBackend::new();
    let (backend, switch) = FlakyBackend::wrap(Box::new(shared.clone()));
    let cache = CacheStore::open_with_backend(Box::new(backend), CacheConfig::default()).unwrap();
    let books = cache.collection("books");
    books.save(entity("b1", 1, json!({}))).unwrap();

    switch.fail_after(16);
    let batch = (2..10).map(|i| entity(&format!("b{i}"), i, json!({})));
    assert!(matches!(books.save_all(batch), Err(CacheError::Storage(_))));
    assert!(switch.has_tripped());
    assert_eq!(books.count(&Query::new()), 1);

    drop(cache);
    let recovered = reopen(&shared);
    assert_eq!(recovered.collection("books").count(&Query::new()), 1);
}

#[test]
fn failed_sync_leaves_state_untouched() {
    let (backend, switch) = FlakyBackend::wrap(Box::new(InMemoryBackend::new()));
    let cache = CacheStore::open_with_backend(Box::new(backend), CacheConfig::default()).unwrap();
    let books = cache.collection("books");

    switch.set_fail_on_sync(true);
    assert!(books.save(entity("b1", 1, json!({}))).is_err());
    assert!(books.find_by_id("b1").is_none());

    switch.reset();
    books.save(entity("b1", 1, json!({}))).unwrap();
    assert!(books.find_by_id("b1").is_some());
}

#[test]
fn torn_tail_from_crash_is_discarded() {
    let shared = InMemoryBackend::new();
    {
        let cache = reopen(&shared);
        cache.collection("books").save(entity("b1", 1, json!({}))).unwrap();
    }
    let mut raw = shared.clone();
    raw.append(b"KVCJ\x00\x01").unwrap();

    let cache = reopen(&shared);
    assert!(cache.collection("books").find_by_id("b1").is_some());
    cache.collection("books").save(entity("b2", 2, json!({}))).unwrap();
    drop(cache);

    assert_eq!(reopen(&shared).collection("books").count(&Query::new()), 2);
}

#[test]
fn corrupted_commit_refuses_to_open() {
    let shared = InMemoryBackend::new();
    {
        let cache = reopen(&shared);
        cache.collection("books").save(entity("b1", 1, json!({}))).unwrap();
    }
    shared.corrupt_byte(20, 0xFF).unwrap();

    let result = CacheStore::open_with_backend(Box::new(shared), CacheConfig::default());
    assert!(matches!(result, Err(CacheError::ChecksumMismatch { .. })));
}

#[test]
fn directory_is_locked_while_open() {
    with_file_cache(|_cache, path| {
        let second = CacheStore::open(path, CacheConfig::default());
        assert!(matches!(second, Err(CacheError::Locked)));
    });
}

#[test]
fn manual_compaction_preserves_queries() {
    let test_cache = scenarios::populated_cache("books", 50);
    let books = test_cache.collection("books");
    books.remove(&Query::new().filter(Filter::lt("index", 25))).unwrap();

    let before = test_cache.journal_size().unwrap();
    test_cache.compact().unwrap();
    assert!(test_cache.journal_size().unwrap() < before);

    let rest = books.find(&Query::new().sort_descending("index").limit(3));
    let ids: Vec<_> = rest.iter().map(|e| e.id().to_string()).collect();
    assert_eq!(ids, ["49", "48", "47"]);
}
