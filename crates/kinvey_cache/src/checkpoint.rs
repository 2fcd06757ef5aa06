//! Per-query sync checkpoints.

use crate::query::Query;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the checkpoint of a (collection, query, projection) triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Collection name.
    pub collection: String,
    /// Query signature (see [`Query::signature`]).
    pub query: String,
    /// Normalized projection (see [`Query::fields_key`]).
    pub fields: String,
}

impl CheckpointKey {
    /// Derives the key of `query` in `collection`.
    #[must_use]
    pub fn new(collection: &str, query: &Query) -> Self {
        Self {
            collection: collection.to_string(),
            query: query.signature(),
            fields: query.fields_key(),
        }
    }

    /// Whether `other` names the same query under a different projection.
    #[must_use]
    pub fn is_sibling_of(&self, other: &CheckpointKey) -> bool {
        self.collection == other.collection && self.query == other.query && self.fields != other.fields
    }
}

/// The last synchronized point of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Collection name.
    pub collection: String,
    /// Query signature.
    pub query: String,
    /// Normalized projection, empty when unprojected.
    pub fields: String,
    /// Server time of the request that produced this state.
    pub last_sync: DateTime<Utc>,
    /// Skip of the last page fetched by the pull that wrote this checkpoint.
    pub skip: Option<usize>,
    /// Limit of the last page fetched by the pull that wrote this checkpoint.
    pub limit: Option<usize>,
}

impl Checkpoint {
    /// A checkpoint for `query` at `last_sync`.
    #[must_use]
    pub fn new(collection: &str, query: &Query, last_sync: DateTime<Utc>) -> Self {
        let key = CheckpointKey::new(collection, query);
        Self {
            collection: key.collection,
            query: key.query,
            fields: key.fields,
            last_sync,
            skip: None,
            limit: None,
        }
    }

    /// Records the page window of a paginated pull.
    #[must_use]
    pub fn with_window(mut self, skip: Option<usize>, limit: Option<usize>) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }

    /// The key this checkpoint is stored under.
    #[must_use]
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey {
            collection: self.collection.clone(),
            query: self.query.clone(),
            fields: self.fields.clone(),
        }
    }

    /// The projection as a list, empty when unprojected.
    #[must_use]
    pub fn field_list(&self) -> Vec<&str> {
        if self.fields.is_empty() {
            Vec::new()
        } else {
            self.fields.split(',').collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;

    #[test]
    fn projection_changes_the_key() {
        let query = Query::new().filter(Filter::eq("team", "red"));
        let projected = query.clone().fields(["name"]);

        let plain = CheckpointKey::new("books", &query);
        let narrow = CheckpointKey::new("books", &projected);
        assert_ne!(plain, narrow);
        assert!(plain.is_sibling_of(&narrow));
        assert!(!plain.is_sibling_of(&plain));
        assert!(!plain.is_sibling_of(&CheckpointKey::new("authors", &projected)));
    }

    #[test]
    fn window_and_sort_do_not_change_the_key() {
        let query = Query::new().filter(Filter::eq("team", "red"));
        assert_eq!(
            CheckpointKey::new("books", &query),
            CheckpointKey::new("books", &query.clone().sort_ascending("name").limit(10))
        );
    }

    #[test]
    fn checkpoint_key_round_trip() {
        let at = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let query = Query::new().fields(["b", "a"]);
        let checkpoint = Checkpoint::new("books", &query, at).with_window(Some(20), Some(10));

        assert_eq!(checkpoint.key(), CheckpointKey::new("books", &query));
        assert_eq!(checkpoint.field_list(), ["a", "b"]);
        assert_eq!(checkpoint.skip, Some(20));
        assert!(Checkpoint::new("books", &Query::new(), at).field_list().is_empty());
    }
}
