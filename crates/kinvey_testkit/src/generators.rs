//! Property-based test generators using proptest.
//!
//! Provides strategies for the shapes the sync engine compares: entity ids,
//! `_kmd.lmt` strings, and (id -> lmt) snapshots of a collection.

use crate::fixtures::lmt;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// A collection snapshot: entity id to its `_kmd.lmt`, if it has one.
pub type LmtSnapshot = BTreeMap<String, Option<String>>;

/// Strategy for entity ids drawn from a small pool, so snapshots overlap.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    (0u8..32).prop_map(|n| format!("e{n:02}"))
}

/// Strategy for valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for `_kmd.lmt` values: mostly valid timestamps within a day of
/// the fixture epoch, sometimes missing.
pub fn lmt_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        9 => (0i64..86_400).prop_map(|s| Some(lmt(s))),
        1 => Just(None),
    ]
}

/// Strategy for one collection snapshot.
pub fn snapshot_strategy() -> impl Strategy<Value = LmtSnapshot> {
    prop::collection::btree_map(entity_id_strategy(), lmt_strategy(), 0..24)
}

/// Strategy for a (local, remote) snapshot pair where the remote side is
/// derived from the local one: some entries kept, some touched later, some
/// dropped, plus new ones.
pub fn snapshot_pair_strategy() -> impl Strategy<Value = (LmtSnapshot, LmtSnapshot)> {
    (snapshot_strategy(), snapshot_strategy()).prop_flat_map(|(local, extra)| {
        let ids: Vec<String> = local.keys().cloned().collect();
        let fates = prop::collection::vec(0u8..4, ids.len());
        (Just(local), Just(extra), Just(ids), fates).prop_map(|(local, extra, ids, fates)| {
            let mut remote = LmtSnapshot::new();
            for (id, fate) in ids.iter().zip(fates) {
                match fate {
                    // unchanged
                    0 | 1 => {
                        remote.insert(id.clone(), local[id].clone());
                    }
                    // modified after the local copy
                    2 => {
                        remote.insert(id.clone(), Some(lmt(100_000)));
                    }
                    // deleted remotely
                    _ => {}
                }
            }
            for (id, value) in extra {
                if !local.contains_key(&id) {
                    remote.insert(id, value);
                }
            }
            (local, remote)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn ids_come_from_the_pool(id in entity_id_strategy()) {
            prop_assert!(id.starts_with('e'));
            prop_assert_eq!(id.len(), 3);
        }

        #[test]
        fn pair_remote_never_older_for_kept_ids((local, remote) in snapshot_pair_strategy()) {
            for (id, remote_lmt) in &remote {
                if let (Some(Some(l)), Some(r)) = (local.get(id), remote_lmt) {
                    prop_assert!(r >= l);
                }
            }
        }
    }
}
