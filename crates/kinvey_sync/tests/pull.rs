//! Pull strategies, fallbacks and checkpoint bookkeeping.

mod common;

use common::{titles, Harness, BOOKS};
use kinvey_cache::{CacheConfig, CacheStore, Query, ID_FIELD, METADATA_FIELD};
use kinvey_storage::InMemoryBackend;
use kinvey_sync::mock::{MockFailure, MockOp};
use kinvey_sync::{Options, ServerErrorKind, StoreType, SyncConfig, SyncError};
use kinvey_testkit::FlakyBackend;
use std::collections::BTreeSet;
use std::time::Duration;

fn delta_config() -> SyncConfig {
    SyncConfig::default().with_delta_set(true)
}

fn last_request_time(h: &Harness, op: MockOp) -> chrono::DateTime<chrono::Utc> {
    h.backend
        .requests()
        .into_iter()
        .filter(|r| r.op == op)
        .last()
        .expect("request was made")
        .server_time
}

#[tokio::test]
async fn full_then_delta_created_then_delta_deleted() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    let original = h.seed("Dune");
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    // Empty cache: full fetch.
    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(h.cached().count(&all), 1);
    assert_eq!(
        h.cached().last_sync(&all),
        Some(last_request_time(&h, MockOp::Fetch))
    );

    // One record created remotely.
    h.seed("Emma");
    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 2);
    assert_eq!(h.cached().count(&all), 2);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 1);

    // The original deleted remotely.
    h.backend.remove_remote(BOOKS, original.id());
    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(titles(&pulled), vec!["Emma"]);
    assert_eq!(h.cached().count(&all), 1);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 2);
    assert_eq!(h.requests_of(MockOp::Fetch), 1);
}

#[tokio::test]
async fn projected_checkpoint_is_not_reused_unprojected() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    h.backend.seed(BOOKS, common::book("Dune").with("year", 1965));
    let store = h.store(StoreType::Sync);
    let opts = Options::default();
    let all = Query::new();
    let projected = Query::new().fields(["title"]);

    let pulled = store.pull(&projected, &opts).await.unwrap();
    assert!(pulled[0].get("year").is_none());
    assert!(h.cached().checkpoint(&projected).is_some());
    assert!(h.cached().checkpoint(&all).is_none());

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled[0].get("year"), Some(&serde_json::json!(1965)));
    assert_eq!(h.requests_of(MockOp::Fetch), 2);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 0);

    // The projected checkpoint described records that were just replaced.
    assert!(h.cached().checkpoint(&projected).is_none());
    assert_eq!(h.cached().checkpoints().len(), 1);
}

#[tokio::test]
async fn oversized_delta_without_pagination_fails_and_keeps_checkpoint() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    h.seed_many(3);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let checkpoint = h.cached().checkpoint(&all);

    h.seed_many(2);
    h.backend.set_max_delta_results(Some(1));
    let err = store.pull(&all, &opts).await.unwrap_err();

    assert_eq!(
        err.server_kind(),
        Some(&ServerErrorKind::ResultSetSizeExceeded)
    );
    assert_eq!(h.cached().checkpoint(&all), checkpoint);
    assert_eq!(h.cached().count(&all), 3);
    assert_eq!(h.requests_of(MockOp::Fetch), 1);
}

#[tokio::test]
async fn oversized_delta_with_pagination_refetches_from_first_page() {
    let config = delta_config()
        .with_auto_pagination(true)
        .with_page_size(2);
    let h = Harness::with_config(config);
    h.backend.enable_delta_set(BOOKS);
    h.seed_many(3);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    h.seed_many(3);
    h.backend.set_max_delta_results(Some(1));
    h.backend.clear_requests();

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 6);

    let requests = h.backend.requests();
    let ops: Vec<MockOp> = requests.iter().map(|r| r.op).collect();
    assert_eq!(
        ops,
        vec![
            MockOp::FetchDelta,
            MockOp::Count,
            MockOp::Fetch,
            MockOp::Fetch,
            MockOp::Fetch
        ]
    );
    let first_page = requests
        .iter()
        .find(|r| r.op == MockOp::Fetch)
        .expect("paged fetch");
    assert_eq!(first_page.query.as_ref().and_then(|q| q.skip), Some(0));

    let checkpoint = h.cached().checkpoint(&all).unwrap();
    assert_eq!(checkpoint.last_sync, first_page.server_time);
    assert_eq!((checkpoint.skip, checkpoint.limit), (Some(4), Some(2)));
}

#[tokio::test]
async fn checkpoint_predating_activation_falls_back_to_full_fetch() {
    let h = Harness::with_config(delta_config());
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    h.backend.enable_delta_set(BOOKS);
    h.seed("Late arrival");

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 3);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 1);
    assert_eq!(h.requests_of(MockOp::Fetch), 2);
    assert_eq!(
        h.cached().last_sync(&all),
        Some(last_request_time(&h, MockOp::Fetch))
    );

    // The refreshed checkpoint is inside the delta window.
    store.pull(&all, &opts).await.unwrap();
    assert_eq!(h.requests_of(MockOp::FetchDelta), 2);
    assert_eq!(h.requests_of(MockOp::Fetch), 2);
}

#[tokio::test]
async fn failed_fallback_fetch_keeps_the_old_checkpoint() {
    let h = Harness::with_config(delta_config());
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let checkpoint = h.cached().checkpoint(&all);
    assert!(checkpoint.is_some());

    // The checkpoint predates activation, and the refetch then fails.
    h.backend.enable_delta_set(BOOKS);
    h.backend.fail_next_on(MockOp::Fetch, MockFailure::Network);
    let err = store.pull(&all, &opts).await.unwrap_err();

    assert!(matches!(err, SyncError::Network { .. }));
    assert_eq!(h.requests_of(MockOp::FetchDelta), 1);
    assert_eq!(h.cached().checkpoint(&all), checkpoint);
    assert_eq!(h.cached().count(&all), 2);

    // The next pull retries the same fallback.
    assert_eq!(store.pull(&all, &opts).await.unwrap().len(), 2);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 2);
}

#[tokio::test]
async fn unconfigured_delta_disables_it_for_the_handle() {
    let h = Harness::with_config(delta_config());
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 2);
    assert!(store.is_delta_set_disabled());
    assert_eq!(h.requests_of(MockOp::FetchDelta), 1);

    store.pull(&all, &opts).await.unwrap();
    assert_eq!(h.requests_of(MockOp::FetchDelta), 1);
    assert_eq!(h.requests_of(MockOp::Fetch), 3);

    // A fresh handle tries again.
    let fresh = h.store(StoreType::Sync);
    fresh.pull(&all, &opts).await.unwrap();
    assert_eq!(h.requests_of(MockOp::FetchDelta), 2);
}

#[tokio::test]
async fn repeated_delta_pull_is_idempotent() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    h.seed_many(4);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let first = store.pull(&all, &opts).await.unwrap();
    let second = store.pull(&all, &opts).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.cached().count(&all), 4);
    assert_eq!(h.requests_of(MockOp::FetchDelta), 2);
    assert_eq!(h.requests_of(MockOp::Fetch), 1);
}

#[tokio::test]
async fn checkpoint_tracks_the_latest_pull() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    let mut previous = None;
    for round in 0..3 {
        h.seed(&format!("Round {round}"));
        store.pull(&all, &opts).await.unwrap();

        let latest = h.backend.requests().last().map(|r| r.server_time);
        let last_sync = h.cached().last_sync(&all);
        assert_eq!(last_sync, latest);
        assert!(last_sync > previous);
        previous = last_sync;
    }
}

#[tokio::test]
async fn client_computed_delta_fetches_only_changed_ids() {
    let config = delta_config().with_max_ids_per_query(1);
    let h = Harness::with_config(config);
    let books = h.seed_many(3);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::builder().server_side_delta(false).build().unwrap();

    store.pull(&all, &opts).await.unwrap();

    h.backend
        .seed(BOOKS, books[1].clone().with("title", "Book 1, revised"));
    h.backend.remove_remote(BOOKS, books[2].id());
    h.seed("Book 3");
    h.backend.clear_requests();

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(titles(&pulled), vec!["Book 0", "Book 1, revised", "Book 3"]);

    let requests = h.backend.requests();
    assert!(requests.iter().all(|r| r.op == MockOp::Fetch));
    // Snapshot, then one request per changed id.
    assert_eq!(requests.len(), 3);
    let snapshot_fields = &requests[0].query.as_ref().unwrap().fields;
    let expected: BTreeSet<String> = [ID_FIELD, METADATA_FIELD]
        .iter()
        .map(|f| f.to_string())
        .collect();
    assert_eq!(snapshot_fields, &expected);
}

#[tokio::test]
async fn timed_out_page_leaves_cache_untouched() {
    let config = SyncConfig::default()
        .with_auto_pagination(true)
        .with_page_size(2)
        .with_timeout(Duration::from_millis(100));
    let h = Harness::with_config(config);
    h.seed_many(5);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    h.backend
        .fail_after(MockOp::Fetch, 1, MockFailure::Hang);
    let err = store.pull(&all, &opts).await.unwrap_err();

    assert!(matches!(err, SyncError::Timeout));
    assert!(err.is_retryable());
    assert_eq!(h.cached().count(&all), 0);
    assert!(h.cached().checkpoint(&all).is_none());

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(pulled.len(), 5);
}

#[tokio::test]
async fn network_failure_keeps_previous_state() {
    let h = Harness::with_config(delta_config());
    h.backend.enable_delta_set(BOOKS);
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let checkpoint = h.cached().checkpoint(&all);
    h.seed("Unseen");

    h.backend
        .fail_next_on(MockOp::FetchDelta, MockFailure::Network);
    let err = store.pull(&all, &opts).await.unwrap_err();
    assert!(matches!(err, SyncError::Network { retryable: true, .. }));
    assert_eq!(h.cached().checkpoint(&all), checkpoint);
    assert_eq!(h.cached().count(&all), 2);
    // Transport errors are not a reason to fall back.
    assert_eq!(h.requests_of(MockOp::Fetch), 1);
}

#[tokio::test]
async fn failed_cache_commit_leaves_pull_state_untouched() {
    let (backend, switch) = FlakyBackend::wrap(Box::new(InMemoryBackend::new()));
    let cache = CacheStore::open_with_backend(Box::new(backend), CacheConfig::default()).unwrap();
    let h = Harness::with_cache(cache, delta_config());
    h.backend.enable_delta_set(BOOKS);
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    let before = h.cached().find(&all);
    let checkpoint = h.cached().checkpoint(&all);
    h.seed("Unseen");

    // Torn journal write.
    switch.fail_after(8);
    let err = store.pull(&all, &opts).await.unwrap_err();
    assert!(matches!(err, SyncError::Cache(_)));
    assert!(switch.has_tripped());
    assert_eq!(h.cached().find(&all), before);
    assert_eq!(h.cached().checkpoint(&all), checkpoint);

    // Failed sync after a complete write.
    switch.reset();
    switch.set_fail_on_sync(true);
    let err = store.pull(&all, &opts).await.unwrap_err();
    assert!(matches!(err, SyncError::Cache(_)));
    assert_eq!(h.cached().find(&all), before);
    assert_eq!(h.cached().checkpoint(&all), checkpoint);

    switch.reset();
    assert_eq!(store.pull(&all, &opts).await.unwrap().len(), 3);
    assert_ne!(h.cached().checkpoint(&all), checkpoint);
}

#[tokio::test]
async fn empty_paginated_pull_makes_one_page_request() {
    let config = SyncConfig::default()
        .with_auto_pagination(true)
        .with_page_size(2);
    let h = Harness::with_config(config);
    let store = h.store(StoreType::Sync);
    let all = Query::new();

    assert!(store.pull(&all, &Options::default()).await.unwrap().is_empty());
    let ops: Vec<MockOp> = h.backend.requests().iter().map(|r| r.op).collect();
    assert_eq!(ops, vec![MockOp::Count, MockOp::Fetch]);
    assert!(h.cached().checkpoint(&all).is_some());
}

#[tokio::test]
async fn paginated_pull_stays_inside_the_query_window() {
    let config = SyncConfig::default()
        .with_auto_pagination(true)
        .with_page_size(2);
    let h = Harness::with_config(config);
    h.seed_many(6);
    let store = h.store(StoreType::Sync);
    let window = Query::new().sort_ascending("index").skip(1).limit(3);

    let pulled = store.pull(&window, &Options::default()).await.unwrap();
    assert_eq!(titles(&pulled), vec!["Book 1", "Book 2", "Book 3"]);
    assert_eq!(h.cached().count(&Query::new()), 3);
    assert!(h.cached().checkpoints().is_empty());

    let pages: Vec<(Option<usize>, Option<usize>)> = h
        .backend
        .requests()
        .iter()
        .filter(|r| r.op == MockOp::Fetch)
        .map(|r| {
            let q = r.query.as_ref().expect("fetch carries its query");
            (q.skip, q.limit)
        })
        .collect();
    assert_eq!(pages, vec![(Some(1), Some(2)), (Some(3), Some(1))]);
}

#[tokio::test]
async fn full_fetch_drops_records_gone_from_the_server() {
    let h = Harness::new();
    let books = h.seed_many(3);
    let store = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    store.pull(&all, &opts).await.unwrap();
    h.backend.remove_remote(BOOKS, books[0].id());

    let pulled = store.pull(&all, &opts).await.unwrap();
    assert_eq!(titles(&pulled), vec!["Book 1", "Book 2"]);
    assert_eq!(h.cached().count(&all), 2);
}

#[tokio::test]
async fn windowed_pull_returns_the_page_without_checkpoint() {
    let h = Harness::new();
    h.seed_many(5);
    let store = h.store(StoreType::Sync);
    let page = Query::new().sort_ascending("index").skip(1).limit(2);

    let pulled = store.pull(&page, &Options::default()).await.unwrap();
    assert_eq!(titles(&pulled), vec!["Book 1", "Book 2"]);
    assert_eq!(h.cached().count(&Query::new()), 2);
    assert!(h.cached().checkpoints().is_empty());
}

#[tokio::test]
async fn pull_is_refused_while_changes_are_pending() {
    let h = Harness::new();
    let store = h.store(StoreType::Sync);
    let opts = Options::default();

    store.save(common::book("Local"), &opts, |_| {}).await;
    let err = store.pull(&Query::new(), &opts).await.unwrap_err();

    assert!(matches!(err, SyncError::PendingChanges { count: 1 }));
    assert!(err.to_string().starts_with("You must push all pending sync items"));
    assert_eq!(h.requests_of(MockOp::Fetch), 0);
}

#[tokio::test]
async fn concurrent_pulls_of_one_query_are_rejected() {
    let h = Harness::new();
    h.seed_many(2);
    let first = h.store(StoreType::Sync);
    let second = h.store(StoreType::Sync);
    let all = Query::new();
    let opts = Options::default();

    h.backend
        .fail_next_on(MockOp::Fetch, MockFailure::Delay(Duration::from_millis(50)));
    let (a, b) = tokio::join!(first.pull(&all, &opts), second.pull(&all, &opts));

    assert_eq!(a.unwrap().len(), 2);
    assert!(matches!(b, Err(SyncError::PullInProgress { .. })));
    assert_eq!(h.requests_of(MockOp::Fetch), 1);

    // The scope is released once the first pull finishes.
    assert_eq!(second.pull(&all, &opts).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_pulls_of_different_queries_proceed() {
    let h = Harness::new();
    h.seed_many(2);
    let store = h.store(StoreType::Sync);
    let opts = Options::default();
    let all = Query::new();
    let projected = Query::new().fields(["title"]);

    h.backend
        .fail_next_on(MockOp::Fetch, MockFailure::Delay(Duration::from_millis(20)));
    let (a, b) = tokio::join!(store.pull(&all, &opts), store.pull(&projected, &opts));
    assert!(a.is_ok());
    assert!(b.is_ok());
}

#[tokio::test]
async fn network_store_cannot_pull() {
    let h = Harness::new();
    let store = h.store(StoreType::Network);
    let err = store.pull(&Query::new(), &Options::default()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidStoreType {
            operation: "pull",
            ..
        }
    ));
}
