//! Write transactions.

use crate::checkpoint::{Checkpoint, CheckpointKey};
use crate::entity::Entity;
use crate::error::{CacheError, CacheResult};
use crate::pending::{collapse, Collapse, PendingKind, PendingOperation};
use crate::query::Query;
use crate::state::{CacheState, Mutation};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

/// Stages changes to one collection for a single atomic commit.
///
/// Reads see the committed state as of the start of the transaction,
/// except for pending operations, which also reflect what this
/// transaction has staged.
pub struct WriteTxn<'a> {
    collection: &'a str,
    state: &'a CacheState,
    mutations: Vec<Mutation>,
    next_seq: u64,
    staged_pending: HashMap<String, Option<PendingKind>>,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(collection: &'a str, state: &'a CacheState) -> Self {
        Self {
            collection,
            state,
            mutations: Vec::new(),
            next_seq: state.next_pending_seq(),
            staged_pending: HashMap::new(),
        }
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    /// The collection this transaction writes to.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.collection
    }

    /// A committed entity.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.state.get(self.collection, id)
    }

    /// Committed entities matching `query`.
    #[must_use]
    pub fn find(&self, query: &Query) -> Vec<Entity> {
        self.state.find(self.collection, query)
    }

    /// Id and last modified time of committed entities matching the filter.
    #[must_use]
    pub fn ids_and_lmts(&self, query: &Query) -> BTreeMap<String, Option<String>> {
        self.state.ids_and_lmts(self.collection, query)
    }

    /// Upserts an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidEntity`] if the entity has no id.
    pub fn put(&mut self, entity: Entity) -> CacheResult<()> {
        if !entity.has_id() {
            return Err(CacheError::invalid_entity("cannot cache an entity without _id"));
        }
        self.mutations.push(Mutation::PutEntity {
            collection: self.collection.to_string(),
            entity,
        });
        Ok(())
    }

    /// Removes an entity by id.
    pub fn delete(&mut self, id: &str) {
        self.mutations.push(Mutation::DeleteEntity {
            collection: self.collection.to_string(),
            id: id.to_string(),
        });
    }

    /// Removes every committed entity matching the filter; returns their ids.
    pub fn delete_matching(&mut self, query: &Query) -> Vec<String> {
        let ids = self.state.matching_ids(self.collection, query);
        for id in &ids {
            self.delete(id);
        }
        ids
    }

    /// Swaps the entity stored under `old_id` for `entity` in one step.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidEntity`] if the new entity has no id.
    pub fn replace_id(&mut self, old_id: &str, entity: Entity) -> CacheResult<()> {
        if !old_id.is_empty() && old_id != entity.id() {
            self.delete(old_id);
        }
        self.put(entity)
    }

    /// Removes all entities of the collection.
    pub fn clear_entities(&mut self) {
        self.mutations.push(Mutation::ClearEntities {
            collection: self.collection.to_string(),
        });
    }

    /// A committed checkpoint.
    #[must_use]
    pub fn checkpoint(&self, key: &CheckpointKey) -> Option<&Checkpoint> {
        self.state.checkpoint(key)
    }

    /// Committed checkpoints of the collection.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<&Checkpoint> {
        self.state.checkpoints(self.collection).collect()
    }

    /// Upserts a checkpoint.
    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.mutations.push(Mutation::PutCheckpoint(checkpoint));
    }

    /// Removes a checkpoint.
    pub fn remove_checkpoint(&mut self, key: CheckpointKey) {
        self.mutations.push(Mutation::DeleteCheckpoint(key));
    }

    /// Removes every checkpoint of the collection.
    pub fn clear_checkpoints(&mut self) {
        self.mutations.push(Mutation::ClearCheckpoints {
            collection: self.collection.to_string(),
        });
    }

    /// The pending operation kind for `id`, including staged changes.
    #[must_use]
    pub fn pending(&self, id: &str) -> Option<PendingKind> {
        match self.staged_pending.get(id) {
            Some(staged) => *staged,
            None => self.state.pending(self.collection, id).map(|op| op.kind),
        }
    }

    /// Whether `id` has a local change awaiting push.
    #[must_use]
    pub fn has_pending(&self, id: &str) -> bool {
        self.pending(id).is_some()
    }

    /// Records a local change for push, folding it into any existing entry.
    ///
    /// Returns the kind now pending, or `None` when the change cancelled
    /// the existing entry (a never-pushed entity was deleted).
    pub fn record_pending(&mut self, id: &str, kind: PendingKind) -> Option<PendingKind> {
        match collapse(self.pending(id), kind) {
            Collapse::Cancel => {
                self.remove_pending(id);
                None
            }
            Collapse::Keep(kind) => {
                let created_at = self
                    .state
                    .pending(self.collection, id)
                    .map_or_else(Utc::now, |op| op.created_at);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.mutations.push(Mutation::PutPending(PendingOperation {
                    seq,
                    collection: self.collection.to_string(),
                    object_id: id.to_string(),
                    kind,
                    created_at,
                }));
                self.staged_pending.insert(id.to_string(), Some(kind));
                Some(kind)
            }
        }
    }

    /// Drops the pending operation for `id`.
    pub fn remove_pending(&mut self, id: &str) {
        self.mutations.push(Mutation::DeletePending {
            collection: self.collection.to_string(),
            object_id: id.to_string(),
        });
        self.staged_pending.insert(id.to_string(), None);
    }

    /// Drops every pending operation of the collection.
    pub fn clear_pending(&mut self) {
        for op in self.state.pending_in(self.collection) {
            self.staged_pending.insert(op.object_id, None);
        }
        self.mutations.push(Mutation::ClearPending {
            collection: self.collection.to_string(),
        });
    }
}
