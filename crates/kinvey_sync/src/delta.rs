//! Delta set computation from (id, last modified time) snapshots.

use kinvey_cache::parse_timestamp;
use std::collections::{BTreeMap, BTreeSet};

/// Ids that differ between a local and a remote snapshot of one query scope.
///
/// The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    /// Present remotely, absent locally.
    pub created: BTreeSet<String>,
    /// Present on both sides, remote copy newer.
    pub updated: BTreeSet<String>,
    /// Present locally, absent remotely.
    pub deleted: BTreeSet<String>,
}

impl DeltaSet {
    /// True when the snapshots agree.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Ids whose full records must be fetched.
    pub fn to_fetch(&self) -> impl Iterator<Item = &String> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Compares a local snapshot against a remote one.
///
/// Timestamps are compared as instants, so equal times written differently
/// are not an update. A remote record without a timestamp, or one whose
/// local copy has none, counts as updated.
pub fn compute_delta_set(
    local: &BTreeMap<String, Option<String>>,
    remote: &BTreeMap<String, Option<String>>,
) -> DeltaSet {
    let mut delta = DeltaSet::default();

    for (id, remote_lmt) in remote {
        match local.get(id) {
            None => {
                delta.created.insert(id.clone());
            }
            Some(local_lmt) => {
                if is_newer(remote_lmt.as_deref(), local_lmt.as_deref()) {
                    delta.updated.insert(id.clone());
                }
            }
        }
    }

    delta.deleted = local
        .keys()
        .filter(|id| !remote.contains_key(*id))
        .cloned()
        .collect();
    delta
}

fn is_newer(remote: Option<&str>, local: Option<&str>) -> bool {
    match (remote, local) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(remote), Some(local)) => match (parse_timestamp(remote), parse_timestamp(local)) {
            (Some(r), Some(l)) => r > l,
            _ => remote != local,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinvey_testkit::{lmt, snapshot_pair_strategy, snapshot_strategy};
    use proptest::prelude::*;

    fn snapshot(pairs: &[(&str, Option<i64>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(id, s)| (id.to_string(), s.map(lmt)))
            .collect()
    }

    #[test]
    fn classifies_each_id() {
        let local = snapshot(&[("a", Some(1)), ("b", Some(1)), ("c", Some(1))]);
        let remote = snapshot(&[("a", Some(1)), ("b", Some(2)), ("d", Some(1))]);

        let delta = compute_delta_set(&local, &remote);
        assert_eq!(delta.created, BTreeSet::from(["d".to_string()]));
        assert_eq!(delta.updated, BTreeSet::from(["b".to_string()]));
        assert_eq!(delta.deleted, BTreeSet::from(["c".to_string()]));
        assert_eq!(delta.to_fetch().count(), 2);
    }

    #[test]
    fn equal_instants_in_different_notation_are_unchanged() {
        let local = BTreeMap::from([("a".to_string(), Some("2024-01-01T00:00:00.000Z".to_string()))]);
        let remote =
            BTreeMap::from([("a".to_string(), Some("2024-01-01T01:00:00.000+01:00".to_string()))]);
        assert!(compute_delta_set(&local, &remote).is_empty());
    }

    #[test]
    fn older_remote_copy_is_not_an_update() {
        let local = snapshot(&[("a", Some(5))]);
        let remote = snapshot(&[("a", Some(4))]);
        assert!(compute_delta_set(&local, &remote).is_empty());
    }

    #[test]
    fn missing_timestamps() {
        let local = snapshot(&[("a", None), ("b", Some(1)), ("c", None)]);
        let remote = snapshot(&[("a", Some(1)), ("b", None), ("c", None)]);
        let delta = compute_delta_set(&local, &remote);
        assert_eq!(delta.updated.len(), 2);
        assert!(!delta.updated.contains("c"));
    }

    proptest! {
        #[test]
        fn remote_only_ids_are_created((local, remote) in snapshot_pair_strategy()) {
            let delta = compute_delta_set(&local, &remote);
            for id in remote.keys().filter(|id| !local.contains_key(*id)) {
                prop_assert!(delta.created.contains(id));
            }
        }

        #[test]
        fn equal_timestamps_are_untouched((local, remote) in snapshot_pair_strategy()) {
            let delta = compute_delta_set(&local, &remote);
            for (id, value) in &remote {
                if local.get(id) == Some(value) {
                    prop_assert!(!delta.updated.contains(id));
                    prop_assert!(!delta.deleted.contains(id));
                }
            }
        }

        #[test]
        fn local_only_ids_are_deleted((local, remote) in snapshot_pair_strategy()) {
            let delta = compute_delta_set(&local, &remote);
            for id in local.keys().filter(|id| !remote.contains_key(*id)) {
                prop_assert!(delta.deleted.contains(id));
            }
        }

        #[test]
        fn sets_are_disjoint(local in snapshot_strategy(), remote in snapshot_strategy()) {
            let delta = compute_delta_set(&local, &remote);
            prop_assert!(delta.created.is_disjoint(&delta.updated));
            prop_assert!(delta.created.is_disjoint(&delta.deleted));
            prop_assert!(delta.updated.is_disjoint(&delta.deleted));
        }

        #[test]
        fn identical_snapshots_have_no_delta(snapshot in snapshot_strategy()) {
            prop_assert!(compute_delta_set(&snapshot, &snapshot).is_empty());
        }
    }
}
