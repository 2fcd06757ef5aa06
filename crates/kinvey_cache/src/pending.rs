//! Pending local changes awaiting push.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a pending operation will do on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    /// `POST`: the entity only exists locally, under a temporary id.
    Create,
    /// `PUT`: the entity exists on the server and was changed locally.
    Update,
    /// `DELETE`: the entity was removed locally.
    Delete,
}

/// One outbox entry. At most one exists per (collection, id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Monotonic sequence; push replays in this order.
    pub seq: u64,
    /// Collection name.
    pub collection: String,
    /// Id of the affected entity.
    pub object_id: String,
    /// Operation to replay.
    pub kind: PendingKind,
    /// When the change was first recorded.
    pub created_at: DateTime<Utc>,
}

/// Result of folding a new local change into an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Collapse {
    /// Store an entry of this kind.
    Keep(PendingKind),
    /// Drop the entry: the changes cancel out.
    Cancel,
}

/// Folds `next` into the entry already pending for the same id.
pub(crate) fn collapse(existing: Option<PendingKind>, next: PendingKind) -> Collapse {
    use PendingKind::{Create, Delete, Update};
    match (existing, next) {
        (Some(Create), Create | Update) => Collapse::Keep(Create),
        (Some(Create), Delete) => Collapse::Cancel,
        (Some(Update | Delete), Create | Update) => Collapse::Keep(Update),
        (_, Delete) => Collapse::Keep(Delete),
        (None, kind) => Collapse::Keep(kind),
    }
}
