//! An in-memory backend for testing.
//!
//! [`MockBackend`] behaves like the app-data API closely enough to drive
//! every pull strategy: it stamps `_kmd`, keeps tombstones for deletes,
//! serves delta sets once enabled per collection, and can be scripted to
//! fail or stall individual requests.

use crate::error::{ServerErrorKind, SyncError, SyncResult};
use crate::network::{DeltaResponse, FetchResponse, NetworkService};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use kinvey_cache::{parse_timestamp, Entity, Metadata, Query};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// Which network call a request was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// [`NetworkService::fetch`]
    Fetch,
    /// [`NetworkService::fetch_delta`]
    FetchDelta,
    /// [`NetworkService::count`]
    Count,
    /// [`NetworkService::get`]
    Get,
    /// [`NetworkService::create`]
    Create,
    /// [`NetworkService::update`]
    Update,
    /// [`NetworkService::delete`]
    Delete,
    /// [`NetworkService::delete_matching`]
    DeleteMatching,
}

/// One logged request.
#[derive(Debug, Clone, PartialEq)]
pub struct MockRequest {
    /// Call kind.
    pub op: MockOp,
    /// Collection name.
    pub collection: String,
    /// Query, for query-based calls.
    pub query: Option<Query>,
    /// Entity id, for id-based calls.
    pub id: Option<String>,
    /// `since`, for delta calls.
    pub since: Option<DateTime<Utc>>,
    /// Server time assigned to the request.
    pub server_time: DateTime<Utc>,
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    /// Fail with a retryable network error.
    Network,
    /// Fail with a server error of this kind.
    Server(ServerErrorKind),
    /// Never answer (sleeps for an hour), so the caller's timeout fires.
    Hang,
    /// Answer normally after a delay.
    Delay(Duration),
}

#[derive(Debug)]
struct FailurePlan {
    op: Option<MockOp>,
    skip: usize,
    failure: MockFailure,
}

#[derive(Debug)]
struct Inner {
    clock: DateTime<Utc>,
    collections: HashMap<String, BTreeMap<String, Entity>>,
    tombstones: HashMap<String, Vec<(String, DateTime<Utc>)>>,
    delta_enabled: HashMap<String, DateTime<Utc>>,
    max_delta_results: Option<usize>,
    failures: VecDeque<FailurePlan>,
    requests: Vec<MockRequest>,
    next_id: u64,
}

impl Inner {
    /// Returns the current time and advances the clock one second.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = self.clock;
        self.clock += ChronoDuration::seconds(1);
        now
    }

    fn take_failure(&mut self, op: MockOp) -> Option<MockFailure> {
        let index = self
            .failures
            .iter()
            .position(|plan| plan.op.map_or(true, |o| o == op))?;
        let plan = &mut self.failures[index];
        if plan.skip > 0 {
            plan.skip -= 1;
            return None;
        }
        self.failures.remove(index).map(|plan| plan.failure)
    }

    fn store(&mut self, collection: &str, mut entity: Entity, now: DateTime<Utc>) -> Entity {
        if !entity.has_id() || entity.is_temporary() {
            self.next_id += 1;
            entity.set_id(format!("{:024x}", self.next_id));
        }
        let table = self.collections.entry(collection.to_string()).or_default();
        let ect = table
            .get(entity.id())
            .and_then(Entity::metadata)
            .and_then(|m| m.ect);
        let mut metadata = Metadata::created_at(now);
        if ect.is_some() {
            metadata.ect = ect;
        }
        entity.set_metadata(&metadata);
        table.insert(entity.id().to_string(), entity.clone());
        entity
    }

    fn remove(&mut self, collection: &str, id: &str, now: DateTime<Utc>) -> bool {
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|table| table.remove(id))
            .is_some();
        if removed {
            self.tombstones
                .entry(collection.to_string())
                .or_default()
                .push((id.to_string(), now));
        }
        removed
    }

    fn entities(&self, collection: &str) -> impl Iterator<Item = &Entity> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(BTreeMap::values)
    }
}

/// An in-memory app-data backend.
///
/// The clock starts at 2024-01-01T00:00:00Z and advances one second per
/// request (and per seeding call); a request's server time is the clock
/// value when it started.
#[derive(Debug)]
pub struct MockBackend {
    inner: Mutex<Inner>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        let clock = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            inner: Mutex::new(Inner {
                clock,
                collections: HashMap::new(),
                tombstones: HashMap::new(),
                delta_enabled: HashMap::new(),
                max_delta_results: None,
                failures: VecDeque::new(),
                requests: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// The time the next request will be stamped with.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().clock
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: ChronoDuration) {
        self.inner.lock().clock += by;
    }

    /// Stores a record as if another client had saved it; returns it with
    /// its assigned id and `_kmd`.
    pub fn seed(&self, collection: &str, entity: Entity) -> Entity {
        let mut inner = self.inner.lock();
        let now = inner.tick();
        inner.store(collection, entity, now)
    }

    /// Deletes a record as if another client had; returns whether it existed.
    pub fn remove_remote(&self, collection: &str, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = inner.tick();
        inner.remove(collection, id, now)
    }

    /// Current server-side records of a collection, in id order.
    pub fn entities(&self, collection: &str) -> Vec<Entity> {
        self.inner.lock().entities(collection).cloned().collect()
    }

    /// Turns on delta-set support for a collection, effective from now.
    pub fn enable_delta_set(&self, collection: &str) {
        let mut inner = self.inner.lock();
        let now = inner.clock;
        inner.delta_enabled.insert(collection.to_string(), now);
    }

    /// Caps the number of changed plus deleted entries a delta may return.
    pub fn set_max_delta_results(&self, max: Option<usize>) {
        self.inner.lock().max_delta_results = max;
    }

    /// Fails the next request of any kind.
    pub fn fail_next(&self, failure: MockFailure) {
        self.push_failure(None, 0, failure);
    }

    /// Fails the next request of kind `op`.
    pub fn fail_next_on(&self, op: MockOp, failure: MockFailure) {
        self.push_failure(Some(op), 0, failure);
    }

    /// Lets `skip` requests of kind `op` through, then fails the next one.
    pub fn fail_after(&self, op: MockOp, skip: usize, failure: MockFailure) {
        self.push_failure(Some(op), skip, failure);
    }

    fn push_failure(&self, op: Option<MockOp>, skip: usize, failure: MockFailure) {
        self.inner
            .lock()
            .failures
            .push_back(FailurePlan { op, skip, failure });
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.inner.lock().requests.clone()
    }

    /// Number of requests of kind `op` received so far.
    pub fn count_of(&self, op: MockOp) -> usize {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|r| r.op == op)
            .count()
    }

    /// Forgets the request log.
    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }

    /// Logs the request, assigns its server time and applies any scripted
    /// failure. The lock is released before sleeping.
    async fn begin(&self, mut request: MockRequest) -> SyncResult<DateTime<Utc>> {
        let (server_time, failure) = {
            let mut inner = self.inner.lock();
            let server_time = inner.tick();
            request.server_time = server_time;
            let op = request.op;
            inner.requests.push(request);
            (server_time, inner.take_failure(op))
        };
        let Some(failure) = failure else {
            return Ok(server_time);
        };
        match failure {
            MockFailure::Network => Err(SyncError::network_retryable("mock network failure")),
            MockFailure::Server(kind) => Err(SyncError::server(kind, "mock server error")),
            MockFailure::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(SyncError::network_retryable("mock request abandoned"))
            }
            MockFailure::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(server_time)
            }
        }
    }

    fn request(op: MockOp, collection: &str) -> MockRequest {
        MockRequest {
            op,
            collection: collection.to_string(),
            query: None,
            id: None,
            since: None,
            server_time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

fn not_found(collection: &str, id: &str) -> SyncError {
    SyncError::server(
        ServerErrorKind::EntityNotFound,
        format!("This entity not found in the collection {collection}: {id}"),
    )
}

#[async_trait]
impl NetworkService for MockBackend {
    async fn fetch(&self, collection: &str, query: &Query) -> SyncResult<FetchResponse> {
        let server_time = self
            .begin(MockRequest {
                query: Some(query.clone()),
                ..Self::request(MockOp::Fetch, collection)
            })
            .await?;
        let inner = self.inner.lock();
        let records = query
            .apply(inner.entities(collection))
            .into_iter()
            .map(|e| e.project(&query.fields))
            .collect();
        Ok(FetchResponse {
            records,
            server_time,
        })
    }

    async fn fetch_delta(
        &self,
        collection: &str,
        query: &Query,
        since: DateTime<Utc>,
    ) -> SyncResult<DeltaResponse> {
        let server_time = self
            .begin(MockRequest {
                query: Some(query.clone()),
                since: Some(since),
                ..Self::request(MockOp::FetchDelta, collection)
            })
            .await?;
        let inner = self.inner.lock();

        let Some(activated) = inner.delta_enabled.get(collection) else {
            return Err(SyncError::server(
                ServerErrorKind::MissingConfiguration,
                "This feature is not properly configured for this app backend.",
            ));
        };
        if since < *activated {
            return Err(SyncError::server(
                ServerErrorKind::ParameterValueOutOfRange,
                "The 'since' timestamp must be after delta set was enabled.",
            ));
        }

        let changed: Vec<Entity> = query
            .without_window()
            .apply(inner.entities(collection))
            .into_iter()
            .filter(|e| {
                e.last_modified()
                    .and_then(parse_timestamp)
                    .map_or(true, |lmt| lmt >= since)
            })
            .map(|e| e.project(&query.fields))
            .collect();
        let deleted: Vec<String> = inner
            .tombstones
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|(_, at)| *at >= since)
            .map(|(id, _)| id.clone())
            .collect();

        if let Some(max) = inner.max_delta_results {
            if changed.len() + deleted.len() > max {
                return Err(SyncError::server(
                    ServerErrorKind::ResultSetSizeExceeded,
                    format!("Your query produced more than {max} results."),
                ));
            }
        }
        Ok(DeltaResponse {
            changed,
            deleted,
            server_time,
        })
    }

    async fn count(&self, collection: &str, query: &Query) -> SyncResult<usize> {
        self.begin(MockRequest {
            query: Some(query.clone()),
            ..Self::request(MockOp::Count, collection)
        })
        .await?;
        let inner = self.inner.lock();
        Ok(inner.entities(collection).filter(|e| query.matches(e)).count())
    }

    async fn get(&self, collection: &str, id: &str) -> SyncResult<Entity> {
        self.begin(MockRequest {
            id: Some(id.to_string()),
            ..Self::request(MockOp::Get, collection)
        })
        .await?;
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .and_then(|table| table.get(id))
            .cloned()
            .ok_or_else(|| not_found(collection, id))
    }

    async fn create(&self, collection: &str, entity: &Entity) -> SyncResult<Entity> {
        let now = self
            .begin(MockRequest {
                id: entity.has_id().then(|| entity.id().to_string()),
                ..Self::request(MockOp::Create, collection)
            })
            .await?;
        Ok(self.inner.lock().store(collection, entity.clone(), now))
    }

    async fn update(&self, collection: &str, entity: &Entity) -> SyncResult<Entity> {
        let now = self
            .begin(MockRequest {
                id: Some(entity.id().to_string()),
                ..Self::request(MockOp::Update, collection)
            })
            .await?;
        Ok(self.inner.lock().store(collection, entity.clone(), now))
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<usize> {
        let now = self
            .begin(MockRequest {
                id: Some(id.to_string()),
                ..Self::request(MockOp::Delete, collection)
            })
            .await?;
        if self.inner.lock().remove(collection, id, now) {
            Ok(1)
        } else {
            Err(not_found(collection, id))
        }
    }

    async fn delete_matching(&self, collection: &str, query: &Query) -> SyncResult<usize> {
        let now = self
            .begin(MockRequest {
                query: Some(query.clone()),
                ..Self::request(MockOp::DeleteMatching, collection)
            })
            .await?;
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner
            .entities(collection)
            .filter(|e| query.matches(e))
            .map(|e| e.id().to_string())
            .collect();
        for id in &ids {
            inner.remove(collection, id, now);
        }
        Ok(ids.len())
    }
}
