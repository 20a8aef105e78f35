//! Read-only view of group → predicate ownership.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::GroupId;

/// Ownership record for one predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub predicate: String,
    pub group_id: GroupId,
    /// Set when ownership was assigned by a restore rather than negotiated.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub tablets: BTreeMap<String, Tablet>,
    /// crc32 of the sorted tablet names
    #[serde(default)]
    pub checksum: u32,
}

/// Snapshot of the cluster topology as published by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    /// Bumped every time the view is refreshed
    pub counter: u64,
    pub groups: BTreeMap<GroupId, GroupState>,
}

impl MembershipState {
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    /// Predicates per group, sorted, one entry for every group (even empty ones).
    pub fn predicate_map(&self) -> BTreeMap<GroupId, Vec<String>> {
        self.groups
            .iter()
            .map(|(gid, group)| (*gid, group.tablets.keys().cloned().collect()))
            .collect()
    }

    pub fn owner_of(&self, predicate: &str) -> Option<GroupId> {
        self.groups
            .iter()
            .find(|(_, group)| group.tablets.contains_key(predicate))
            .map(|(gid, _)| *gid)
    }

    pub fn predicates(&self) -> BTreeSet<String> {
        self.groups
            .values()
            .flat_map(|group| group.tablets.keys().cloned())
            .collect()
    }

    /// Recompute every group checksum from its tablets.
    pub fn recompute_checksums(&mut self) {
        for group in self.groups.values_mut() {
            let mut hasher = crc32fast::Hasher::new();
            for name in group.tablets.keys() {
                hasher.update(name.as_bytes());
                hasher.update(&[0]);
            }
            group.checksum = hasher.finalize();
        }
    }

    /// Move `predicate` to `group`, removing it from whichever group held it.
    pub fn assign(&mut self, predicate: &str, group: GroupId, force: bool) -> Tablet {
        for state in self.groups.values_mut() {
            state.tablets.remove(predicate);
        }
        let tablet = Tablet {
            predicate: predicate.to_string(),
            group_id: group,
            force,
        };
        self.groups
            .entry(group)
            .or_default()
            .tablets
            .insert(predicate.to_string(), tablet.clone());
        tablet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> MembershipState {
        let mut state = MembershipState::default();
        state.assign("name", 1, false);
        state.assign("age", 1, false);
        state.assign("friend", 2, false);
        state.groups.entry(3).or_default();
        state
    }

    #[test]
    fn test_predicate_map_partitions_predicates() {
        let map = state().predicate_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&1], vec!["age".to_string(), "name".to_string()]);
        assert_eq!(map[&2], vec!["friend".to_string()]);
        assert!(map[&3].is_empty());

        let total: usize = map.values().map(Vec::len).sum();
        assert_eq!(total, state().predicates().len());
    }

    #[test]
    fn test_assign_moves_ownership() {
        let mut state = state();
        let tablet = state.assign("name", 2, true);
        assert_eq!(tablet.group_id, 2);
        assert!(tablet.force);
        assert_eq!(state.owner_of("name"), Some(2));
        assert!(!state.groups[&1].tablets.contains_key("name"));
    }

    #[test]
    fn test_checksum_tracks_tablets() {
        let mut state = state();
        state.recompute_checksums();
        let before = state.groups[&1].checksum;
        state.assign("name", 2, true);
        state.recompute_checksums();
        assert_ne!(before, state.groups[&1].checksum);
    }
}
