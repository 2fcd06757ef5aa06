//! Replaying pending changes, sync and purge.

use crate::error::{ServerErrorKind, SyncError, SyncResult};
use crate::network::NetworkService;
use crate::options::{Options, ResolvedOptions};
use crate::pull::InFlight;
use crate::store::DataStore;
use kinvey_cache::{Entity, PendingKind, PendingOperation, Query};
use tracing::{debug, info, warn};

/// A pending operation the backend rejected.
#[derive(Debug)]
pub struct PushFailure {
    /// Id of the affected entity.
    pub object_id: String,
    /// What was being replayed.
    pub kind: PendingKind,
    /// Why it failed.
    pub error: SyncError,
}

/// Result of a push.
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Operations the backend accepted.
    pub pushed: usize,
    /// Operations it rejected.
    pub failures: Vec<PushFailure>,
}

impl PushOutcome {
    /// Whether every operation went through.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a sync: the push half and the pulled entities.
#[derive(Debug)]
pub struct SyncOutcome {
    /// Operations the backend accepted.
    pub pushed: usize,
    /// Operations it rejected.
    pub push_failures: Vec<PushFailure>,
    /// Entities returned by the pull.
    pub entities: Vec<Entity>,
}

impl SyncOutcome {
    /// Number of rejected pending operations.
    pub fn push_error_count(&self) -> usize {
        self.push_failures.len()
    }
}

impl<N: NetworkService + ?Sized> DataStore<N> {
    /// Replays pending operations in the order they were recorded.
    ///
    /// Each accepted operation leaves the queue together with its cache
    /// update. A rejected one stays queued, except when the backend
    /// refuses it for insufficient credentials, which no retry can fix.
    /// One push, sync or purge runs per collection at a time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStoreType` on a network store, `PushInProgress` if
    /// the collection's queue is already being worked, or a cache error.
    /// Backend rejections are reported in [`PushOutcome::failures`].
    pub async fn push(&self, options: &Options) -> SyncResult<PushOutcome> {
        self.require_cache("push")?;
        let opts = self.resolve(options)?;
        let _pushing = self.claim_queue()?;
        self.push_pending(&opts).await
    }

    /// Claims the collection's pending queue until the guard drops.
    fn claim_queue(&self) -> SyncResult<InFlight<String>> {
        InFlight::acquire(&self.pushing, self.collection.clone()).ok_or_else(|| {
            SyncError::PushInProgress {
                collection: self.collection.clone(),
            }
        })
    }

    async fn push_pending(&self, opts: &ResolvedOptions) -> SyncResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        for op in self.local().pending_operations() {
            match self.push_one(&op, opts).await {
                Ok(true) => outcome.pushed += 1,
                Ok(false) => {}
                Err(err @ SyncError::Cache(_)) => return Err(err),
                Err(err) => {
                    if err.server_kind() == Some(&ServerErrorKind::InsufficientCredentials) {
                        self.drop_pending(&op.object_id)?;
                    }
                    warn!(
                        collection = %self.collection,
                        id = %op.object_id,
                        kind = ?op.kind,
                        error = %err,
                        "push rejected"
                    );
                    outcome.failures.push(PushFailure {
                        object_id: op.object_id,
                        kind: op.kind,
                        error: err,
                    });
                }
            }
        }
        info!(
            collection = %self.collection,
            pushed = outcome.pushed,
            failed = outcome.failures.len(),
            "push finished"
        );
        Ok(outcome)
    }

    /// Replays one operation; `false` if there was nothing left to send.
    async fn push_one(&self, op: &PendingOperation, opts: &ResolvedOptions) -> SyncResult<bool> {
        let id = op.object_id.as_str();
        match op.kind {
            PendingKind::Create | PendingKind::Update => {
                let Some(entity) = self.local().find_by_id(id) else {
                    debug!(collection = %self.collection, id, "entity gone, dropping pending save");
                    self.drop_pending(id)?;
                    return Ok(false);
                };
                let saved = if op.kind == PendingKind::Create {
                    self.timed(opts.timeout, self.network.create(&self.collection, &entity))
                        .await?
                } else {
                    self.timed(opts.timeout, self.network.update(&self.collection, &entity))
                        .await?
                };
                self.confirm_saved(id, Some(&entity), &saved)?;
            }
            PendingKind::Delete => {
                match self
                    .timed(opts.timeout, self.network.delete(&self.collection, id))
                    .await
                {
                    Err(err) if err.server_kind() == Some(&ServerErrorKind::EntityNotFound) => {}
                    other => {
                        other?;
                    }
                }
                self.drop_pending(id)?;
            }
        }
        Ok(true)
    }

    /// Pushes, then pulls `query` whatever the push left queued.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStoreType` on a network store, `PushInProgress`, a
    /// cache error from the push, or any error of the pull.
    pub async fn sync(&self, query: &Query, options: &Options) -> SyncResult<SyncOutcome> {
        self.require_cache("sync")?;
        let opts = self.resolve(options)?;
        let _pushing = self.claim_queue()?;
        let push = self.push_pending(&opts).await?;
        let entities = self.pull_into_cache(query, &opts).await?;
        Ok(SyncOutcome {
            pushed: push.pushed,
            push_failures: push.failures,
            entities,
        })
    }

    /// Discards every pending change, restores server copies, then pulls
    /// `query`. Returns how many pending operations were discarded.
    ///
    /// Pending updates are reverted to the server copy, or dropped from the
    /// cache if the server has none. Pending creates are removed along with
    /// their entity. Pending deletes are forgotten; the pull brings the
    /// entity back.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStoreType` on a network store, or the first network,
    /// server or cache error. Operations discarded before it stay discarded.
    pub async fn purge(&self, query: &Query, options: &Options) -> SyncResult<usize> {
        self.require_cache("purge")?;
        let opts = self.resolve(options)?;
        let _pushing = self.claim_queue()?;
        let operations = self.local().pending_operations();

        for op in &operations {
            let id = op.object_id.as_str();
            match op.kind {
                PendingKind::Update => {
                    match self
                        .timed(opts.timeout, self.network.get(&self.collection, id))
                        .await
                    {
                        Ok(server) => self.local().write(|txn| {
                            txn.remove_pending(id);
                            txn.put(server)
                        })?,
                        Err(err) if err.server_kind() == Some(&ServerErrorKind::EntityNotFound) => {
                            self.discard(id)?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                PendingKind::Create => self.discard(id)?,
                PendingKind::Delete => self.drop_pending(id)?,
            }
        }
        info!(collection = %self.collection, purged = operations.len(), "purged pending changes");

        self.pull_into_cache(query, &opts).await?;
        Ok(operations.len())
    }

    fn drop_pending(&self, id: &str) -> SyncResult<()> {
        self.local().write(|txn| {
            txn.remove_pending(id);
            Ok(())
        })?;
        Ok(())
    }

    /// Removes an entity and its pending operation.
    fn discard(&self, id: &str) -> SyncResult<()> {
        self.local().write(|txn| {
            txn.delete(id);
            txn.remove_pending(id);
            Ok(())
        })?;
        Ok(())
    }
}
