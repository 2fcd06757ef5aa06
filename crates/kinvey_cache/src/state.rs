//! In-memory cache state and the mutations that change it.

use crate::checkpoint::{Checkpoint, CheckpointKey};
use crate::entity::Entity;
use crate::pending::PendingOperation;
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One change to the cache. A commit is an ordered list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Mutation {
    PutEntity { collection: String, entity: Entity },
    DeleteEntity { collection: String, id: String },
    ClearEntities { collection: String },
    PutCheckpoint(Checkpoint),
    DeleteCheckpoint(CheckpointKey),
    ClearCheckpoints { collection: String },
    PutPending(PendingOperation),
    DeletePending { collection: String, object_id: String },
    ClearPending { collection: String },
}

/// Everything the cache holds, as written by compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub entities: Vec<(String, Vec<Entity>)>,
    pub checkpoints: Vec<Checkpoint>,
    pub pending: Vec<PendingOperation>,
    pub next_pending_seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    collections: BTreeMap<String, BTreeMap<String, Entity>>,
    checkpoints: BTreeMap<CheckpointKey, Checkpoint>,
    pending: BTreeMap<(String, String), PendingOperation>,
    next_pending_seq: u64,
}

impl CacheState {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = Self {
            next_pending_seq: snapshot.next_pending_seq,
            ..Self::default()
        };
        for (collection, entities) in snapshot.entities {
            let table = state.collections.entry(collection).or_default();
            for entity in entities {
                table.insert(entity.id().to_string(), entity);
            }
        }
        for checkpoint in snapshot.checkpoints {
            state.checkpoints.insert(checkpoint.key(), checkpoint);
        }
        for op in snapshot.pending {
            state
                .pending
                .insert((op.collection.clone(), op.object_id.clone()), op);
        }
        state
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            entities: self
                .collections
                .iter()
                .map(|(name, table)| (name.clone(), table.values().cloned().collect()))
                .collect(),
            checkpoints: self.checkpoints.values().cloned().collect(),
            pending: self.pending.values().cloned().collect(),
            next_pending_seq: self.next_pending_seq,
        }
    }

    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutEntity { collection, entity } => {
                self.collections
                    .entry(collection)
                    .or_default()
                    .insert(entity.id().to_string(), entity);
            }
            Mutation::DeleteEntity { collection, id } => {
                if let Some(table) = self.collections.get_mut(&collection) {
                    table.remove(&id);
                }
            }
            Mutation::ClearEntities { collection } => {
                self.collections.remove(&collection);
            }
            Mutation::PutCheckpoint(checkpoint) => {
                self.checkpoints.insert(checkpoint.key(), checkpoint);
            }
            Mutation::DeleteCheckpoint(key) => {
                self.checkpoints.remove(&key);
            }
            Mutation::ClearCheckpoints { collection } => {
                self.checkpoints.retain(|key, _| key.collection != collection);
            }
            Mutation::PutPending(op) => {
                self.next_pending_seq = self.next_pending_seq.max(op.seq + 1);
                self.pending
                    .insert((op.collection.clone(), op.object_id.clone()), op);
            }
            Mutation::DeletePending {
                collection,
                object_id,
            } => {
                self.pending.remove(&(collection, object_id));
            }
            Mutation::ClearPending { collection } => {
                self.pending.retain(|(c, _), _| *c != collection);
            }
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Entity> {
        self.collections.get(collection)?.get(id)
    }

    fn entities<'a>(&'a self, collection: &str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    pub fn find(&self, collection: &str, query: &Query) -> Vec<Entity> {
        query.apply(self.entities(collection))
    }

    pub fn count(&self, collection: &str, query: &Query) -> usize {
        self.entities(collection).filter(|e| query.matches(e)).count()
    }

    pub fn matching_ids(&self, collection: &str, query: &Query) -> Vec<String> {
        self.entities(collection)
            .filter(|e| query.matches(e))
            .map(|e| e.id().to_string())
            .collect()
    }

    pub fn ids_and_lmts(&self, collection: &str, query: &Query) -> BTreeMap<String, Option<String>> {
        self.entities(collection)
            .filter(|e| query.matches(e))
            .map(|e| (e.id().to_string(), e.last_modified().map(str::to_string)))
            .collect()
    }

    pub fn checkpoint(&self, key: &CheckpointKey) -> Option<&Checkpoint> {
        self.checkpoints.get(key)
    }

    pub fn checkpoints<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a Checkpoint> + 'a {
        self.checkpoints
            .values()
            .filter(move |c| c.collection == collection)
    }

    pub fn pending(&self, collection: &str, id: &str) -> Option<&PendingOperation> {
        self.pending.get(&(collection.to_string(), id.to_string()))
    }

    pub fn pending_in(&self, collection: &str) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> = self
            .pending
            .values()
            .filter(|op| op.collection == collection)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    pub fn next_pending_seq(&self) -> u64 {
        self.next_pending_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingKind;
    use chrono::Utc;

    fn put(collection: &str, id: &str) -> Mutation {
        Mutation::PutEntity {
            collection: collection.into(),
            entity: Entity::with_id(id),
        }
    }

    #[test]
    fn apply_entities_per_collection() {
        let mut state = CacheState::default();
        state.apply(put("books", "1"));
        state.apply(put("books", "2"));
        state.apply(put("authors", "1"));
        state.apply(Mutation::DeleteEntity {
            collection: "books".into(),
            id: "1".into(),
        });

        assert_eq!(state.count("books", &Query::new()), 1);
        assert_eq!(state.count("authors", &Query::new()), 1);

        state.apply(Mutation::ClearEntities {
            collection: "books".into(),
        });
        assert_eq!(state.count("books", &Query::new()), 0);
        assert_eq!(state.collection_names(), ["authors"]);
    }

    #[test]
    fn pending_sequence_advances() {
        let mut state = CacheState::default();
        state.apply(Mutation::PutPending(PendingOperation {
            seq: 7,
            collection: "books".into(),
            object_id: "1".into(),
            kind: PendingKind::Update,
            created_at: Utc::now(),
        }));
        assert_eq!(state.next_pending_seq(), 8);
        assert!(state.pending("books", "1").is_some());

        state.apply(Mutation::ClearPending {
            collection: "books".into(),
        });
        assert!(state.pending_in("books").is_empty());
        assert_eq!(state.next_pending_seq(), 8);
    }

    #[test]
    fn snapshot_restores_state() {
        let mut state = CacheState::default();
        state.apply(put("books", "1"));
        state.apply(Mutation::PutCheckpoint(Checkpoint::new(
            "books",
            &Query::new(),
            Utc::now(),
        )));

        let restored = CacheState::from_snapshot(state.to_snapshot());
        assert!(restored.get("books", "1").is_some());
        assert_eq!(restored.checkpoints("books").count(), 1);
        assert_eq!(restored.to_snapshot(), state.to_snapshot());
    }
}
