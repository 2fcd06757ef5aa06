//! Data store handles and policy-driven operations.

use crate::config::SyncConfig;
use crate::error::{ServerErrorKind, SyncError, SyncResult};
use crate::network::NetworkService;
use crate::options::{Options, ReadPolicy, ResolvedOptions, StoreType, WritePolicy};
use crate::pull::InFlightRegistry;
use kinvey_cache::{
    is_temporary_id, CacheResult, CacheStore, CheckpointKey, CollectionCache, Entity, PendingKind,
    Query,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The local cache.
    Cache,
    /// The backend.
    Network,
}

/// One result handed to an operation's completion.
///
/// Operations call their completion once per source they target, on the
/// task that awaits them, and always deliver the cache result first.
#[derive(Debug)]
pub struct Delivery<T> {
    /// Where the result came from.
    pub source: Source,
    /// The result.
    pub result: SyncResult<T>,
}

impl<T> Delivery<T> {
    fn at(source: Source, result: SyncResult<T>) -> Self {
        Self { source, result }
    }

    fn cache(result: SyncResult<T>) -> Self {
        Self {
            source: Source::Cache,
            result,
        }
    }

    fn network(result: SyncResult<T>) -> Self {
        Self {
            source: Source::Network,
            result,
        }
    }

    /// Whether the result is a success.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Unwraps the delivery into its result.
    ///
    /// # Errors
    ///
    /// Returns the delivered error.
    pub fn into_result(self) -> SyncResult<T> {
        self.result
    }
}

/// Whether a call reads or writes, which decides the policy it follows.
#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

impl Access {
    /// The source a call under `opts` delivers first.
    fn first_source(self, opts: &ResolvedOptions) -> Source {
        let network_only = match self {
            Access::Read => opts.read_policy == ReadPolicy::NetworkOnly,
            Access::Write => opts.write_policy == WritePolicy::NetworkOnly,
        };
        if network_only {
            Source::Network
        } else {
            Source::Cache
        }
    }
}

/// What a remove targets.
enum Removal<'a> {
    Id(&'a str),
    Query(&'a Query),
}

impl Removal<'_> {
    fn query(&self) -> Query {
        match self {
            Removal::Id(id) => Query::by_ids([*id]),
            Removal::Query(query) => (*query).clone(),
        }
    }
}

/// A handle to one collection with a fixed [`StoreType`].
///
/// Handles are cheap; create them with
/// [`Client::data_store`](crate::Client::data_store).
pub struct DataStore<N: NetworkService + ?Sized> {
    pub(crate) collection: String,
    pub(crate) store_type: StoreType,
    pub(crate) options: Options,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) network: Arc<N>,
    pub(crate) config: SyncConfig,
    pub(crate) in_flight: InFlightRegistry<CheckpointKey>,
    pub(crate) pushing: InFlightRegistry<String>,
    pub(crate) delta_disabled: AtomicBool,
}

impl<N: NetworkService + ?Sized> std::fmt::Debug for DataStore<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("collection", &self.collection)
            .field("store_type", &self.store_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<N: NetworkService + ?Sized> DataStore<N> {
    /// The collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The store type.
    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// Options applied to every call on this handle.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Whether the backend reported delta sets as unconfigured, so this
    /// handle no longer attempts them.
    pub fn is_delta_set_disabled(&self) -> bool {
        self.delta_disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn disable_delta_set(&self) {
        self.delta_disabled.store(true, Ordering::SeqCst);
    }

    /// Merges `options` over the handle's options and applies defaults,
    /// without validating.
    fn settings(&self, options: &Options) -> ResolvedOptions {
        let mut resolved = self
            .options
            .merge(options)
            .resolve(self.store_type, &self.config);
        if !self.store_type.uses_cache() {
            resolved.read_policy = ReadPolicy::NetworkOnly;
            resolved.write_policy = WritePolicy::NetworkOnly;
        }
        resolved
    }

    /// Resolved, validated options for one call.
    pub(crate) fn resolve(&self, options: &Options) -> SyncResult<ResolvedOptions> {
        let resolved = self.settings(options);
        resolved.validate()?;
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), but an invalid call is answered
    /// through `completion`, once, from the source it would reach first.
    fn resolve_for<T>(
        &self,
        options: &Options,
        access: Access,
        completion: &mut impl FnMut(Delivery<T>),
    ) -> Option<ResolvedOptions> {
        let resolved = self.settings(options);
        match resolved.validate() {
            Ok(()) => Some(resolved),
            Err(err) => {
                completion(Delivery::at(access.first_source(&resolved), Err(err)));
                None
            }
        }
    }

    pub(crate) fn local(&self) -> CollectionCache<'_> {
        self.cache.collection(&self.collection)
    }

    pub(crate) fn require_cache(&self, operation: &'static str) -> SyncResult<()> {
        if self.store_type.uses_cache() {
            Ok(())
        } else {
            Err(SyncError::InvalidStoreType {
                operation,
                store_type: self.store_type.name(),
            })
        }
    }

    /// Runs a network call under the timeout.
    pub(crate) async fn timed<T>(
        &self,
        timeout: Duration,
        call: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Stores the backend's copy of a saved entity in place of the one
    /// cached under `old_id` and settles its pending operation, in one
    /// commit.
    ///
    /// `sent` is the cached entity that went out, or `None` when the save
    /// bypassed the cache. If the cached entity changed while the request
    /// was in flight, the newer local fields move to the server id and are
    /// queued as an update; if it was removed, the removal is queued.
    pub(crate) fn confirm_saved(
        &self,
        old_id: &str,
        sent: Option<&Entity>,
        saved: &Entity,
    ) -> CacheResult<()> {
        let new_id = saved.id();
        let kept = self.local().write(|txn| {
            let current = txn.get(old_id).cloned();
            match (sent, current) {
                (Some(sent), Some(mut current)) if current != *sent => {
                    current.set_id(new_id);
                    if let Some(metadata) = saved.metadata() {
                        current.set_metadata(&metadata);
                    }
                    txn.replace_id(old_id, current)?;
                    if old_id != new_id {
                        txn.remove_pending(old_id);
                    }
                    txn.record_pending(new_id, PendingKind::Update);
                    Ok(Some(PendingKind::Update))
                }
                (Some(_), None) => {
                    if old_id != new_id {
                        txn.remove_pending(old_id);
                        txn.record_pending(new_id, PendingKind::Delete);
                    }
                    Ok(Some(PendingKind::Delete))
                }
                _ => {
                    txn.replace_id(old_id, saved.clone())?;
                    if txn.has_pending(old_id) {
                        txn.remove_pending(old_id);
                    }
                    Ok(None)
                }
            }
        })?;
        if let Some(kind) = kept {
            debug!(collection = %self.collection, id = new_id, ?kind, "local change made during save kept for push");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // find / count
    // ------------------------------------------------------------------

    /// Finds entities matching `query`.
    ///
    /// Under [`ReadPolicy::Both`] the completion runs twice: cached results
    /// first, then the network results. Caching store types read the
    /// network through a pull of `query`; if that pull is already running,
    /// the network delivery carries the backend's records uncached.
    pub async fn find(
        &self,
        query: &Query,
        options: &Options,
        mut completion: impl FnMut(Delivery<Vec<Entity>>),
    ) {
        let Some(opts) = self.resolve_for(options, Access::Read, &mut completion) else {
            return;
        };
        if matches!(opts.read_policy, ReadPolicy::CacheOnly | ReadPolicy::Both) {
            completion(Delivery::cache(Ok(self.local().find(query))));
        }
        if matches!(opts.read_policy, ReadPolicy::NetworkOnly | ReadPolicy::Both) {
            completion(Delivery::network(self.find_remote(query, &opts).await));
        }
    }

    async fn find_remote(&self, query: &Query, opts: &ResolvedOptions) -> SyncResult<Vec<Entity>> {
        if self.store_type.uses_cache() {
            match self.pull_into_cache(query, opts).await {
                Err(SyncError::PullInProgress { .. }) => {
                    debug!(collection = %self.collection, "query already being pulled, reading uncached");
                }
                other => return other,
            }
        }
        if opts.auto_pagination {
            return Ok(self.fetch_pages(query, opts).await?.records);
        }
        let response = self
            .timed(opts.timeout, self.network.fetch(&self.collection, query))
            .await?;
        Ok(response.records)
    }

    /// Finds one entity by id.
    ///
    /// A missing entity is delivered as [`SyncError::EntityNotFound`].
    pub async fn find_by_id(
        &self,
        id: &str,
        options: &Options,
        mut completion: impl FnMut(Delivery<Entity>),
    ) {
        let Some(opts) = self.resolve_for(options, Access::Read, &mut completion) else {
            return;
        };
        if matches!(opts.read_policy, ReadPolicy::CacheOnly | ReadPolicy::Both) {
            let result = self.local().find_by_id(id).ok_or_else(|| self.not_found(id));
            completion(Delivery::cache(result));
        }
        if matches!(opts.read_policy, ReadPolicy::NetworkOnly | ReadPolicy::Both) {
            completion(Delivery::network(self.find_by_id_remote(id, &opts).await));
        }
    }

    async fn find_by_id_remote(&self, id: &str, opts: &ResolvedOptions) -> SyncResult<Entity> {
        let entity = match self
            .timed(opts.timeout, self.network.get(&self.collection, id))
            .await
        {
            Err(err) if err.server_kind() == Some(&ServerErrorKind::EntityNotFound) => {
                return Err(self.not_found(id))
            }
            other => other?,
        };
        if self.store_type.uses_cache() {
            self.local().write(|txn| {
                if !txn.has_pending(id) {
                    txn.put(entity.clone())?;
                }
                Ok(())
            })?;
        }
        Ok(entity)
    }

    /// Counts entities matching the filter of `query`.
    pub async fn count(
        &self,
        query: &Query,
        options: &Options,
        mut completion: impl FnMut(Delivery<usize>),
    ) {
        let Some(opts) = self.resolve_for(options, Access::Read, &mut completion) else {
            return;
        };
        if matches!(opts.read_policy, ReadPolicy::CacheOnly | ReadPolicy::Both) {
            completion(Delivery::cache(Ok(self.local().count(query))));
        }
        if matches!(opts.read_policy, ReadPolicy::NetworkOnly | ReadPolicy::Both) {
            let result = self
                .timed(opts.timeout, self.network.count(&self.collection, query))
                .await;
            completion(Delivery::network(result));
        }
    }

    // ------------------------------------------------------------------
    // save
    // ------------------------------------------------------------------

    /// Saves an entity.
    ///
    /// Entities without an id get a temporary one before anything else
    /// happens, so the cache delivery already carries it. Once the backend
    /// confirms a create, the temporary record is swapped for the server
    /// record in a single commit.
    pub async fn save(
        &self,
        entity: Entity,
        options: &Options,
        mut completion: impl FnMut(Delivery<Entity>),
    ) {
        let Some(opts) = self.resolve_for(options, Access::Write, &mut completion) else {
            return;
        };
        match opts.write_policy {
            WritePolicy::CacheOnly => {
                completion(Delivery::cache(self.save_local(entity)));
            }
            WritePolicy::NetworkOnly => {
                let result = self.save_remote(&entity, false, &opts).await;
                completion(Delivery::network(result));
            }
            WritePolicy::LocalThenNetwork => {
                let local = self.save_local(entity);
                let saved = local.as_ref().ok().cloned();
                completion(Delivery::cache(local));
                if let Some(saved) = saved {
                    let result = self.save_remote(&saved, true, &opts).await;
                    completion(Delivery::network(result));
                }
            }
        }
    }

    fn save_local(&self, mut entity: Entity) -> SyncResult<Entity> {
        if !entity.has_id() {
            entity.set_id(Entity::temporary_id());
        }
        let kind = if entity.is_temporary() {
            PendingKind::Create
        } else {
            PendingKind::Update
        };
        let saved = entity.clone();
        self.local().write(|txn| {
            txn.put(entity)?;
            txn.record_pending(saved.id(), kind);
            Ok(())
        })?;
        debug!(collection = %self.collection, id = saved.id(), ?kind, "saved locally");
        Ok(saved)
    }

    /// Sends `entity`; `cached` tells whether it was saved locally first.
    async fn save_remote(
        &self,
        entity: &Entity,
        cached: bool,
        opts: &ResolvedOptions,
    ) -> SyncResult<Entity> {
        let saved = if !entity.has_id() || entity.is_temporary() {
            self.timed(opts.timeout, self.network.create(&self.collection, entity))
                .await?
        } else {
            self.timed(opts.timeout, self.network.update(&self.collection, entity))
                .await?
        };
        if self.store_type.uses_cache() {
            self.confirm_saved(entity.id(), cached.then_some(entity), &saved)?;
        }
        Ok(saved)
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    /// Removes one entity by id; delivers the number removed.
    pub async fn remove_by_id(
        &self,
        id: &str,
        options: &Options,
        completion: impl FnMut(Delivery<usize>),
    ) {
        self.remove_with(Removal::Id(id), options, completion).await;
    }

    /// Removes the entities with the given ids.
    ///
    /// An empty list is rejected with a validation error before any I/O.
    pub async fn remove_by_ids<S: AsRef<str>>(
        &self,
        ids: &[S],
        options: &Options,
        mut completion: impl FnMut(Delivery<usize>),
    ) {
        if ids.is_empty() {
            let error = SyncError::Validation("ids cannot be an empty array".into());
            let source = Access::Write.first_source(&self.settings(options));
            completion(Delivery::at(source, Err(error)));
            return;
        }
        let query = Query::by_ids(ids);
        self.remove_with(Removal::Query(&query), options, completion)
            .await;
    }

    /// Removes entities matching the filter of `query`.
    pub async fn remove(
        &self,
        query: &Query,
        options: &Options,
        completion: impl FnMut(Delivery<usize>),
    ) {
        self.remove_with(Removal::Query(query), options, completion)
            .await;
    }

    /// Removes every entity of the collection.
    pub async fn remove_all(&self, options: &Options, completion: impl FnMut(Delivery<usize>)) {
        self.remove(&Query::new(), options, completion).await;
    }

    async fn remove_with(
        &self,
        target: Removal<'_>,
        options: &Options,
        mut completion: impl FnMut(Delivery<usize>),
    ) {
        let Some(opts) = self.resolve_for(options, Access::Write, &mut completion) else {
            return;
        };
        match opts.write_policy {
            WritePolicy::CacheOnly => {
                let result = self.remove_local(&target.query()).map(|ids| ids.len());
                completion(Delivery::cache(result));
            }
            WritePolicy::NetworkOnly => {
                let result = self.remove_remote(&target, Vec::new(), &opts).await;
                completion(Delivery::network(result));
            }
            WritePolicy::LocalThenNetwork => {
                let removed = match self.remove_local(&target.query()) {
                    Ok(ids) => ids,
                    Err(err) => {
                        completion(Delivery::cache(Err(err)));
                        return;
                    }
                };
                completion(Delivery::cache(Ok(removed.len())));

                let result = match &target {
                    Removal::Id(id) if is_temporary_id(id) => Ok(0),
                    _ => match self.remove_remote(&target, removed, &opts).await {
                        Err(err) if err.server_kind() == Some(&ServerErrorKind::EntityNotFound) => {
                            Ok(0)
                        }
                        other => other,
                    },
                };
                completion(Delivery::network(result));
            }
        }
    }

    /// Removes matching entities from the cache and queues their deletes.
    fn remove_local(&self, query: &Query) -> SyncResult<Vec<String>> {
        let ids = self.local().write(|txn| {
            let ids = txn.delete_matching(query);
            for id in &ids {
                if is_temporary_id(id) && !txn.has_pending(id) {
                    continue;
                }
                txn.record_pending(id, PendingKind::Delete);
            }
            Ok(ids)
        })?;
        Ok(ids)
    }

    async fn remove_remote(
        &self,
        target: &Removal<'_>,
        already_removed: Vec<String>,
        opts: &ResolvedOptions,
    ) -> SyncResult<usize> {
        let count = match target {
            Removal::Id(id) => {
                self.timed(opts.timeout, self.network.delete(&self.collection, id))
                    .await?
            }
            Removal::Query(query) => {
                self.timed(opts.timeout, self.network.delete_matching(&self.collection, query))
                    .await?
            }
        };
        if self.store_type.uses_cache() {
            let query = target.query();
            self.local().write(|txn| {
                let mut ids = txn.delete_matching(&query);
                ids.extend(already_removed);
                for id in &ids {
                    if txn.has_pending(id) {
                        txn.remove_pending(id);
                    }
                }
                Ok(())
            })?;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // local bookkeeping
    // ------------------------------------------------------------------

    /// Number of local changes waiting to be pushed.
    pub fn sync_count(&self) -> usize {
        self.local().pending_count()
    }

    /// Clears cached data for this collection.
    ///
    /// With no query, entities, checkpoints and pending operations all go;
    /// with a query, only matching entities and their pending operations.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStoreType` for network stores, or a cache error.
    pub fn clear_cache(&self, query: Option<&Query>) -> SyncResult<usize> {
        self.require_cache("clear_cache")?;
        Ok(self.local().clear(query)?)
    }

    fn not_found(&self, id: &str) -> SyncError {
        SyncError::EntityNotFound {
            collection: self.collection.clone(),
            id: id.to_string(),
        }
    }
}
