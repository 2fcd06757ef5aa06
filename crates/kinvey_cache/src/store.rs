//! Cache store facade.

use crate::checkpoint::{Checkpoint, CheckpointKey};
use crate::config::CacheConfig;
use crate::dir::CacheDir;
use crate::entity::Entity;
use crate::error::CacheResult;
use crate::journal::Journal;
use crate::pending::{PendingKind, PendingOperation};
use crate::query::Query;
use crate::state::CacheState;
use crate::txn::WriteTxn;
use chrono::{DateTime, Utc};
use kinvey_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// The local cache handle.
///
/// `CacheStore` holds every collection's entities, the sync checkpoints,
/// and the pending-operation outbox. All three live in one journal, so a
/// single [`write`](Self::write) can change them together: either every
/// change in the closure is persisted or none is.
///
/// # Opening a Cache
///
/// ```rust,ignore
/// use kinvey_cache::{CacheConfig, CacheStore};
///
/// let cache = CacheStore::open(Path::new("kinvey_cache"), CacheConfig::default())?;
/// let books = cache.collection("books");
/// books.save(Entity::with_id("b1").with("title", "Dune"))?;
/// ```
///
/// For tests, use [`CacheStore::open_in_memory`].
pub struct CacheStore {
    config: CacheConfig,
    /// Cache directory (holds the lock). None for in-memory caches.
    _dir: Option<CacheDir>,
    /// Serializes writers; held across append and apply.
    journal: Mutex<Journal>,
    state: RwLock<CacheState>,
}

impl CacheStore {
    /// Opens a persistent cache rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another handle holds the directory lock (`Locked`)
    /// - The directory is missing and `create_if_missing` is false (`NotFound`)
    /// - The journal is corrupt (`ChecksumMismatch`, `Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path, config: CacheConfig) -> CacheResult<Self> {
        let dir = CacheDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        let mut store = Self::open_with_backend(Box::new(backend), config)?;
        store._dir = Some(dir);
        debug!(path = %path.display(), "opened cache");
        Ok(store)
    }

    /// Opens a cache that lives only in memory.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other constructors.
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), CacheConfig::default())
    }

    /// Opens a cache over an arbitrary storage backend, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupt.
    pub fn open_with_backend(backend: Box<dyn StorageBackend>, config: CacheConfig) -> CacheResult<Self> {
        let mut journal = Journal::new(backend, config.sync_on_commit);
        let state = journal.replay()?;
        Ok(Self {
            config,
            _dir: None,
            journal: Mutex::new(journal),
            state: RwLock::new(state),
        })
    }

    /// The configuration this cache was opened with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// A handle to one collection.
    #[must_use]
    pub fn collection<'a>(&'a self, name: &'a str) -> CollectionCache<'a> {
        CollectionCache { store: self, name }
    }

    /// Names of collections that currently hold entities.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.state.read().collection_names()
    }

    /// Runs `f` and commits everything it staged as one atomic unit.
    ///
    /// If `f` returns an error, nothing is written. If the journal append
    /// fails, the in-memory state is left as it was. `f` must not call back
    /// into `write` on the same store.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a storage error from the commit.
    pub fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut WriteTxn<'_>) -> CacheResult<T>,
    ) -> CacheResult<T> {
        let mut journal = self.journal.lock();

        let (value, mutations) = {
            let state = self.state.read();
            let mut txn = WriteTxn::new(collection, &state);
            let value = f(&mut txn)?;
            (value, txn.into_mutations())
        };
        if mutations.is_empty() {
            return Ok(value);
        }

        journal.append_commit(&mutations)?;
        {
            let mut state = self.state.write();
            for mutation in mutations {
                state.apply(mutation);
            }
        }

        let threshold = self.config.compact_threshold;
        if threshold > 0 && matches!(journal.size(), Ok(size) if size > threshold) {
            let state = self.state.read();
            if let Err(error) = journal.compact(&state) {
                warn!(%error, "journal compaction failed");
            }
        }
        Ok(value)
    }

    /// Rewrites the journal as a single snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> CacheResult<()> {
        let mut journal = self.journal.lock();
        let state = self.state.read();
        journal.compact(&state)?;
        debug!(size = journal.size()?, "compacted cache journal");
        Ok(())
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn journal_size(&self) -> CacheResult<u64> {
        self.journal.lock().size()
    }

    fn read<T>(&self, f: impl FnOnce(&CacheState) -> T) -> T {
        f(&self.state.read())
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("persistent", &self._dir.is_some())
            .finish_non_exhaustive()
    }
}

/// A borrowed view of one collection in a [`CacheStore`].
#[derive(Debug, Clone, Copy)]
pub struct CollectionCache<'a> {
    store: &'a CacheStore,
    name: &'a str,
}

impl<'a> CollectionCache<'a> {
    /// The collection name.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Runs an atomic write against this collection.
    ///
    /// # Errors
    ///
    /// See [`CacheStore::write`].
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> CacheResult<T>) -> CacheResult<T> {
        self.store.write(self.name, f)
    }

    /// Upserts one entity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEntity` if it has no id, or a storage error.
    pub fn save(&self, entity: Entity) -> CacheResult<()> {
        self.write(|txn| txn.put(entity))
    }

    /// Upserts many entities in one commit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEntity` if any has no id; nothing is written then.
    pub fn save_all(&self, entities: impl IntoIterator<Item = Entity>) -> CacheResult<()> {
        self.write(|txn| entities.into_iter().try_for_each(|entity| txn.put(entity)))
    }

    /// Entities matching `query`, sorted and windowed.
    #[must_use]
    pub fn find(&self, query: &Query) -> Vec<Entity> {
        self.store.read(|state| state.find(self.name, query))
    }

    /// One entity by id.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<Entity> {
        self.store.read(|state| state.get(self.name, id).cloned())
    }

    /// Number of entities matching the query's filter.
    #[must_use]
    pub fn count(&self, query: &Query) -> usize {
        self.store.read(|state| state.count(self.name, query))
    }

    /// Id and `_kmd.lmt` of every entity matching the query's filter.
    #[must_use]
    pub fn ids_and_lmts(&self, query: &Query) -> BTreeMap<String, Option<String>> {
        self.store.read(|state| state.ids_and_lmts(self.name, query))
    }

    /// Removes entities matching the filter; returns how many.
    ///
    /// Pending operations are left untouched.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn remove(&self, query: &Query) -> CacheResult<usize> {
        self.write(|txn| Ok(txn.delete_matching(query).len()))
    }

    /// Removes one entity; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn remove_by_id(&self, id: &str) -> CacheResult<bool> {
        self.write(|txn| {
            let existed = txn.get(id).is_some();
            if existed {
                txn.delete(id);
            }
            Ok(existed)
        })
    }

    /// The checkpoint stored for `query`, if any.
    #[must_use]
    pub fn checkpoint(&self, query: &Query) -> Option<Checkpoint> {
        let key = CheckpointKey::new(self.name, query);
        self.store.read(|state| state.checkpoint(&key).cloned())
    }

    /// Server time of the last successful sync of `query`.
    #[must_use]
    pub fn last_sync(&self, query: &Query) -> Option<DateTime<Utc>> {
        self.checkpoint(query).map(|c| c.last_sync)
    }

    /// Stores the checkpoint for `query`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn set_last_sync(
        &self,
        query: &Query,
        at: DateTime<Utc>,
        skip: Option<usize>,
        limit: Option<usize>,
    ) -> CacheResult<()> {
        let checkpoint = Checkpoint::new(self.name, query, at).with_window(skip, limit);
        self.write(|txn| {
            txn.set_checkpoint(checkpoint);
            Ok(())
        })
    }

    /// Forgets the checkpoint for `query`; the next pull is a full fetch.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn invalidate_last_sync(&self, query: &Query) -> CacheResult<()> {
        let key = CheckpointKey::new(self.name, query);
        self.write(|txn| {
            if txn.checkpoint(&key).is_some() {
                txn.remove_checkpoint(key);
            }
            Ok(())
        })
    }

    /// Every checkpoint of this collection.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.store
            .read(|state| state.checkpoints(self.name).cloned().collect())
    }

    /// Forgets every checkpoint of this collection.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn clear_checkpoints(&self) -> CacheResult<()> {
        self.write(|txn| {
            txn.clear_checkpoints();
            Ok(())
        })
    }

    /// Clears cached data.
    ///
    /// With no query, every entity, checkpoint and pending operation of the
    /// collection goes. With a query, only matching entities and their
    /// pending operations are removed. Returns the number of entities
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the commit fails.
    pub fn clear(&self, query: Option<&Query>) -> CacheResult<usize> {
        self.write(|txn| match query {
            None => {
                let removed = txn.ids_and_lmts(&Query::new()).len();
                txn.clear_entities();
                txn.clear_checkpoints();
                txn.clear_pending();
                Ok(removed)
            }
            Some(query) => {
                let ids = txn.delete_matching(query);
                for id in &ids {
                    if txn.has_pending(id) {
                        txn.remove_pending(id);
                    }
                }
                Ok(ids.len())
            }
        })
    }

    /// Pending operations in push order.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.store.read(|state| state.pending_in(self.name))
    }

    /// Number of pending operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_operations().len()
    }

    /// The pending operation kind for `id`.
    #[must_use]
    pub fn pending(&self, id: &str) -> Option<PendingKind> {
        self.store
            .read(|state| state.pending(self.name, id).map(|op| op.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::query::Filter;
    use serde_json::json;

    fn book(id: &str, title: &str, year: i64) -> Entity {
        Entity::with_id(id).with("title", title).with("year", year)
    }

    #[test]
    fn save_find_remove() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        books
            .save_all([book("1", "Dune", 1965), book("2", "Emma", 1815)])
            .unwrap();

        let old = Query::new().filter(Filter::lt("year", 1900));
        assert_eq!(books.find(&old).len(), 1);
        assert_eq!(books.count(&Query::new()), 2);
        assert_eq!(books.find_by_id("1").unwrap().get("title"), Some(&json!("Dune")));

        assert_eq!(books.remove(&old).unwrap(), 1);
        assert!(books.remove_by_id("1").unwrap());
        assert!(!books.remove_by_id("1").unwrap());
        assert_eq!(books.count(&Query::new()), 0);
    }

    #[test]
    fn failed_write_changes_nothing() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        let size = cache.journal_size().unwrap();

        let result = books.save_all([book("1", "Dune", 1965), Entity::new()]);
        assert!(matches!(result, Err(CacheError::InvalidEntity { .. })));
        assert_eq!(books.count(&Query::new()), 0);
        assert_eq!(cache.journal_size().unwrap(), size);
    }

    #[test]
    fn pending_collapses_within_and_across_writes() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");

        books
            .write(|txn| {
                txn.put(book("tmp_1", "Dune", 1965))?;
                assert_eq!(txn.record_pending("tmp_1", PendingKind::Create), Some(PendingKind::Create));
                assert_eq!(txn.record_pending("tmp_1", PendingKind::Update), Some(PendingKind::Create));
                Ok(())
            })
            .unwrap();
        assert_eq!(books.pending("tmp_1"), Some(PendingKind::Create));

        books
            .write(|txn| {
                txn.delete("tmp_1");
                assert_eq!(txn.record_pending("tmp_1", PendingKind::Delete), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(books.pending_count(), 0);
    }

    #[test]
    fn pending_operations_follow_record_order() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        for id in ["c", "a", "b"] {
            books
                .write(|txn| {
                    txn.record_pending(id, PendingKind::Update);
                    Ok(())
                })
                .unwrap();
        }
        let order: Vec<_> = books
            .pending_operations()
            .into_iter()
            .map(|op| op.object_id)
            .collect();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn checkpoints_per_query() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        let all = Query::new();
        let old = Query::new().filter(Filter::lt("year", 1900));
        let at = Utc::now();

        books.set_last_sync(&all, at, None, None).unwrap();
        assert_eq!(books.last_sync(&all), Some(at));
        assert_eq!(books.last_sync(&old), None);

        books.invalidate_last_sync(&all).unwrap();
        assert_eq!(books.last_sync(&all), None);
    }

    #[test]
    fn clear_with_query_drops_matching_pending_only() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        books
            .write(|txn| {
                txn.put(book("1", "Dune", 1965))?;
                txn.put(book("2", "Emma", 1815))?;
                txn.record_pending("1", PendingKind::Update);
                txn.record_pending("2", PendingKind::Update);
                Ok(())
            })
            .unwrap();
        books.set_last_sync(&Query::new(), Utc::now(), None, None).unwrap();

        let removed = books
            .clear(Some(&Query::new().filter(Filter::eq("title", "Dune"))))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(books.pending("1"), None);
        assert_eq!(books.pending("2"), Some(PendingKind::Update));
        assert_eq!(books.checkpoints().len(), 1);

        assert_eq!(books.clear(None).unwrap(), 1);
        assert_eq!(books.pending_count(), 0);
        assert!(books.checkpoints().is_empty());
    }

    #[test]
    fn collections_are_isolated() {
        let cache = CacheStore::open_in_memory().unwrap();
        cache.collection("books").save(book("1", "Dune", 1965)).unwrap();
        cache.collection("authors").save(Entity::with_id("1")).unwrap();

        cache.collection("books").clear(None).unwrap();
        assert_eq!(cache.collection("authors").count(&Query::new()), 1);
        assert_eq!(cache.collections(), ["authors"]);
    }

    #[test]
    fn replace_id_swaps_temporary_entity() {
        let cache = CacheStore::open_in_memory().unwrap();
        let books = cache.collection("books");
        books.save(book("tmp_x", "Dune", 1965)).unwrap();

        books
            .write(|txn| {
                let stored = txn.get("tmp_x").cloned().unwrap();
                let mut server = stored.clone();
                server.set_id("srv-1");
                txn.replace_id(stored.id(), server)
            })
            .unwrap();
        assert!(books.find_by_id("tmp_x").is_none());
        assert!(books.find_by_id("srv-1").is_some());
    }

    #[test]
    fn auto_compaction_bounds_journal() {
        let backend = InMemoryBackend::new();
        let config = CacheConfig::default().compact_threshold(2048);
        let cache = CacheStore::open_with_backend(Box::new(backend.clone()), config).unwrap();
        let books = cache.collection("books");
        for i in 0..200 {
            books.save(book("1", "Dune", i)).unwrap();
        }
        assert!(cache.journal_size().unwrap() < 4096);

        drop(cache);
        let reopened = CacheStore::open_with_backend(Box::new(backend), config).unwrap();
        let stored = reopened.collection("books").find_by_id("1").unwrap();
        assert_eq!(stored.get("year"), Some(&json!(199)));
    }

    mod outbox_model {
        use super::*;
        use crate::pending::PendingKind;
        use proptest::prelude::*;
        use std::collections::HashMap;

        fn kind_strategy() -> impl Strategy<Value = PendingKind> {
            prop_oneof![
                Just(PendingKind::Create),
                Just(PendingKind::Update),
                Just(PendingKind::Delete),
            ]
        }

        /// Expected outbox after folding each change in.
        fn fold(model: &mut HashMap<String, PendingKind>, id: &str, next: PendingKind) {
            use PendingKind::{Create, Delete, Update};
            match (model.get(id).copied(), next) {
                (Some(Create), Delete) => {
                    model.remove(id);
                }
                (Some(Create), _) => {}
                (Some(_), Create | Update) => {
                    model.insert(id.to_string(), Update);
                }
                (_, kind) => {
                    model.insert(id.to_string(), kind);
                }
            }
        }

        proptest! {
            #[test]
            fn outbox_holds_one_folded_entry_per_id(
                changes in prop::collection::vec(("[a-d]", kind_strategy()), 0..40)
            ) {
                let cache = CacheStore::open_in_memory().unwrap();
                let books = cache.collection("books");
                let mut model = HashMap::new();

                for (id, kind) in &changes {
                    books.write(|txn| {
                        txn.record_pending(id, *kind);
                        Ok(())
                    }).unwrap();
                    fold(&mut model, id, *kind);
                }

                let ops = books.pending_operations();
                prop_assert_eq!(ops.len(), model.len());
                for op in &ops {
                    prop_assert_eq!(model.get(&op.object_id), Some(&op.kind));
                }
                prop_assert!(ops.windows(2).all(|w| w[0].seq < w[1].seq));
            }
        }
    }
}
