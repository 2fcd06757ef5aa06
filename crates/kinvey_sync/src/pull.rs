//! Pulling server state into the cache.
//!
//! A pull picks one of three strategies for its query scope:
//!
//! - **Server delta**: ask the backend for changes since the checkpoint.
//! - **Client delta**: fetch an `_id`/`_kmd` snapshot, diff it against
//!   the cache, then fetch only created and updated records by id.
//! - **Full fetch**: fetch everything, page by page when auto-pagination
//!   is on, and drop cached records the server no longer returns.
//!
//! Delta failures the backend reports as recoverable fall back to a full
//! fetch exactly once. Whatever the strategy, all network I/O finishes
//! before the cache is touched, and the records, deletions and new
//! checkpoint land in a single commit.

use crate::delta::compute_delta_set;
use crate::error::{ServerErrorKind, SyncError, SyncResult};
use crate::network::NetworkService;
use crate::options::{Options, ResolvedOptions};
use crate::store::DataStore;
use chrono::{DateTime, Utc};
use kinvey_cache::{Checkpoint, CheckpointKey, Entity, Query, ID_FIELD, METADATA_FIELD};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keys with an operation currently running: query scopes for pulls,
/// collection names for pushes.
pub(crate) type InFlightRegistry<K> = Arc<Mutex<HashSet<K>>>;

/// Marks a key as busy until dropped.
pub(crate) struct InFlight<K: Eq + Hash> {
    registry: InFlightRegistry<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    /// Claims `key`, or returns `None` if it is already claimed.
    pub(crate) fn acquire(registry: &InFlightRegistry<K>, key: K) -> Option<Self> {
        if registry.lock().insert(key.clone()) {
            Some(Self {
                registry: Arc::clone(registry),
                key,
            })
        } else {
            None
        }
    }
}

impl<K: Eq + Hash> Drop for InFlight<K> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ServerDelta,
    ClientDelta,
    Full,
    Paginated,
}

impl Strategy {
    fn as_str(self) -> &'static str {
        match self {
            Strategy::ServerDelta => "server-delta",
            Strategy::ClientDelta => "client-delta",
            Strategy::Full => "full",
            Strategy::Paginated => "paginated",
        }
    }
}

/// Records gathered by a full or paginated fetch.
#[derive(Debug)]
pub(crate) struct Pages {
    pub records: Vec<Entity>,
    /// Server time of the first page.
    pub server_time: DateTime<Utc>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Everything one pull writes to the cache.
#[derive(Debug)]
struct Changes {
    strategy: Strategy,
    upserts: Vec<Entity>,
    deletes: Vec<String>,
    /// Cached records matching this scope and absent from `upserts` are stale.
    stale_scope: Option<Query>,
    checkpoint: Option<Checkpoint>,
}

impl<N: NetworkService + ?Sized> DataStore<N> {
    /// Replaces cached data for `query` with the server's.
    ///
    /// Returns the cached entities matching the query afterwards, or the
    /// fetched page for a windowed query.
    ///
    /// # Errors
    ///
    /// - `InvalidStoreType` on a network store
    /// - `PendingChanges` while local changes await push
    /// - `PullInProgress` if the same scope is already being pulled
    /// - any network, server or cache error; the cache is then unchanged
    pub async fn pull(&self, query: &Query, options: &Options) -> SyncResult<Vec<Entity>> {
        self.require_cache("pull")?;
        let pending = self.sync_count();
        if pending > 0 {
            return Err(SyncError::PendingChanges { count: pending });
        }
        let opts = self.resolve(options)?;
        self.pull_into_cache(query, &opts).await
    }

    /// Pull without the pending-changes check.
    ///
    /// Entities with pending operations are never overwritten or removed.
    pub(crate) async fn pull_into_cache(
        &self,
        scope: &Query,
        opts: &ResolvedOptions,
    ) -> SyncResult<Vec<Entity>> {
        let key = CheckpointKey::new(&self.collection, scope);
        let _in_flight =
            InFlight::acquire(&self.in_flight, key).ok_or_else(|| SyncError::PullInProgress {
                collection: self.collection.clone(),
            })?;

        let since = if scope.is_windowed() || !opts.delta_set || self.is_delta_set_disabled() {
            None
        } else {
            self.local().last_sync(scope)
        };

        let changes = match since {
            Some(since) => match self.delta_changes(scope, since, opts).await {
                Ok(changes) => changes,
                Err(err) => self.recover_from_delta(err, scope, opts).await?,
            },
            None => self.full_changes(scope, opts).await?,
        };

        if scope.is_windowed() {
            let records = changes.upserts.clone();
            self.apply(changes)?;
            Ok(records)
        } else {
            self.apply(changes)?;
            Ok(self.local().find(scope))
        }
    }

    async fn recover_from_delta(
        &self,
        err: SyncError,
        scope: &Query,
        opts: &ResolvedOptions,
    ) -> SyncResult<Changes> {
        match err.server_kind() {
            Some(ServerErrorKind::ResultSetSizeExceeded) if opts.auto_pagination => {
                warn!(collection = %self.collection, "delta set too large, paging full result");
            }
            Some(ServerErrorKind::ParameterValueOutOfRange) => {
                // The full fetch replaces the checkpoint in its own commit.
                warn!(collection = %self.collection, "checkpoint outside delta window, refetching");
            }
            Some(ServerErrorKind::MissingConfiguration) => {
                warn!(collection = %self.collection, "delta set not configured, disabling for this store");
                self.disable_delta_set();
            }
            _ => return Err(err),
        }
        self.full_changes(scope, opts).await
    }

    async fn delta_changes(
        &self,
        scope: &Query,
        since: DateTime<Utc>,
        opts: &ResolvedOptions,
    ) -> SyncResult<Changes> {
        if opts.server_side_delta {
            let response = self
                .timed(
                    opts.timeout,
                    self.network.fetch_delta(&self.collection, scope, since),
                )
                .await?;
            return Ok(Changes {
                strategy: Strategy::ServerDelta,
                upserts: response.changed,
                deletes: response.deleted,
                stale_scope: None,
                checkpoint: Some(Checkpoint::new(&self.collection, scope, response.server_time)),
            });
        }

        let snapshot_query = scope.clone().fields([ID_FIELD, METADATA_FIELD]);
        let snapshot = self
            .timed(
                opts.timeout,
                self.network.fetch(&self.collection, &snapshot_query),
            )
            .await?;
        let remote: BTreeMap<String, Option<String>> = snapshot
            .records
            .iter()
            .map(|e| (e.id().to_string(), e.last_modified().map(str::to_string)))
            .collect();
        let delta = compute_delta_set(&self.local().ids_and_lmts(scope), &remote);
        debug!(
            collection = %self.collection,
            created = delta.created.len(),
            updated = delta.updated.len(),
            deleted = delta.deleted.len(),
            "computed delta set"
        );

        let ids: Vec<&String> = delta.to_fetch().collect();
        let mut upserts = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(opts.max_ids_per_query) {
            let by_ids = Query::by_ids(chunk).fields(&scope.fields);
            let response = self
                .timed(opts.timeout, self.network.fetch(&self.collection, &by_ids))
                .await?;
            upserts.extend(response.records);
        }

        Ok(Changes {
            strategy: Strategy::ClientDelta,
            upserts,
            deletes: delta.deleted.into_iter().collect(),
            stale_scope: None,
            checkpoint: Some(Checkpoint::new(&self.collection, scope, snapshot.server_time)),
        })
    }

    async fn full_changes(&self, scope: &Query, opts: &ResolvedOptions) -> SyncResult<Changes> {
        let (strategy, pages) = if opts.auto_pagination {
            (Strategy::Paginated, self.fetch_pages(scope, opts).await?)
        } else {
            let response = self
                .timed(opts.timeout, self.network.fetch(&self.collection, scope))
                .await?;
            let pages = Pages {
                records: response.records,
                server_time: response.server_time,
                skip: scope.skip,
                limit: scope.limit,
            };
            (Strategy::Full, pages)
        };

        // A window of the scope says nothing about records outside it.
        let windowed = scope.is_windowed();
        let checkpoint = (!windowed).then(|| {
            Checkpoint::new(&self.collection, scope, pages.server_time)
                .with_window(pages.skip, pages.limit)
        });
        Ok(Changes {
            strategy,
            upserts: pages.records,
            deletes: Vec::new(),
            stale_scope: (!windowed).then(|| scope.clone()),
            checkpoint,
        })
    }

    /// Fetches the records of `scope` one page at a time.
    ///
    /// Pages stay inside the query's own skip/limit window; an unwindowed
    /// scope yields every matching record. The reported server time is the
    /// first page's, so changes made while later pages were fetched are
    /// picked up by the next delta.
    pub(crate) async fn fetch_pages(&self, scope: &Query, opts: &ResolvedOptions) -> SyncResult<Pages> {
        let page_size = opts.page_size;
        let total = self
            .timed(opts.timeout, self.network.count(&self.collection, scope))
            .await?;
        let start = scope.skip.unwrap_or(0);
        let end = scope
            .limit
            .map_or(total, |limit| total.min(start.saturating_add(limit)));
        let page_len = |skip: usize| page_size.min(end.saturating_sub(skip)).max(1);

        let first = self
            .timed(
                opts.timeout,
                self.network
                    .fetch(&self.collection, &scope.window(start, page_len(start))),
            )
            .await?;
        let server_time = first.server_time;
        let mut records = first.records;
        let mut requests = 1;
        let mut skip = start;
        while skip + page_size < end {
            skip += page_size;
            let page = self
                .timed(
                    opts.timeout,
                    self.network
                        .fetch(&self.collection, &scope.window(skip, page_len(skip))),
                )
                .await?;
            records.extend(page.records);
            requests += 1;
        }
        if let Some(limit) = scope.limit {
            records.truncate(limit);
        }
        debug!(collection = %self.collection, total, requests, "fetched pages");

        Ok(Pages {
            records,
            server_time,
            skip: Some(skip),
            limit: Some(page_size),
        })
    }

    fn apply(&self, changes: Changes) -> SyncResult<()> {
        let Changes {
            strategy,
            upserts,
            deletes,
            stale_scope,
            checkpoint,
        } = changes;
        let server_time = checkpoint.as_ref().map(|c| c.last_sync);

        let (written, removed) = self.local().write(|txn| {
            let fetched: HashSet<&str> = upserts.iter().map(Entity::id).collect();
            let stale: Vec<String> = match &stale_scope {
                Some(scope) => txn
                    .ids_and_lmts(scope)
                    .into_keys()
                    .filter(|id| !fetched.contains(id.as_str()))
                    .collect(),
                None => Vec::new(),
            };

            let mut written = 0;
            for entity in &upserts {
                if !txn.has_pending(entity.id()) {
                    txn.put(entity.clone())?;
                    written += 1;
                }
            }
            let mut removed = 0;
            for id in deletes.iter().chain(&stale) {
                if !txn.has_pending(id) && txn.get(id).is_some() {
                    txn.delete(id);
                    removed += 1;
                }
            }

            if let Some(checkpoint) = checkpoint {
                let key = checkpoint.key();
                let siblings: Vec<CheckpointKey> = txn
                    .checkpoints()
                    .into_iter()
                    .map(Checkpoint::key)
                    .filter(|other| other.is_sibling_of(&key))
                    .collect();
                for sibling in siblings {
                    txn.remove_checkpoint(sibling);
                }
                txn.set_checkpoint(checkpoint);
            }
            Ok((written, removed))
        })?;

        info!(
            collection = %self.collection,
            strategy = strategy.as_str(),
            written,
            removed,
            server_time = ?server_time,
            "pull applied"
        );
        Ok(())
    }
}
