//! Network data service abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinvey_cache::{Entity, Query};

/// Records returned by a fetch, with the server's request-start time.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Matching records.
    pub records: Vec<Entity>,
    /// When the server started handling the request.
    pub server_time: DateTime<Utc>,
}

/// Changes since a point in time, as computed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaResponse {
    /// Records created or modified since `since`.
    pub changed: Vec<Entity>,
    /// Ids deleted since `since`.
    pub deleted: Vec<String>,
    /// When the server started handling the request.
    pub server_time: DateTime<Utc>,
}

/// The remote side of a collection.
///
/// This trait abstracts the network layer, allowing different
/// implementations (HTTP, an in-memory mock for tests, etc.).
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Fetches records matching `query`, honoring its window and projection.
    async fn fetch(&self, collection: &str, query: &Query) -> SyncResult<FetchResponse>;

    /// Fetches changes to records matching `query` since `since`.
    ///
    /// Fails with `MissingConfiguration`, `ParameterValueOutOfRange` or
    /// `ResultSetSizeExceeded` server errors when the delta cannot be served.
    async fn fetch_delta(
        &self,
        collection: &str,
        query: &Query,
        since: DateTime<Utc>,
    ) -> SyncResult<DeltaResponse>;

    /// Counts records matching the filter of `query`.
    async fn count(&self, collection: &str, query: &Query) -> SyncResult<usize>;

    /// Fetches one record; `EntityNotFound` if absent.
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Entity>;

    /// Creates a record; the server assigns the id if the entity has none.
    async fn create(&self, collection: &str, entity: &Entity) -> SyncResult<Entity>;

    /// Replaces a record by id.
    async fn update(&self, collection: &str, entity: &Entity) -> SyncResult<Entity>;

    /// Deletes one record; returns how many were deleted.
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<usize>;

    /// Deletes records matching the filter of `query`; returns how many.
    async fn delete_matching(&self, collection: &str, query: &Query) -> SyncResult<usize>;
}
