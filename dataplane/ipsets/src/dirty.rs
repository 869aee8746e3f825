use crate::entity::IpSet;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// The pending member operations for one set. Adds and deletes are always
/// disjoint: absorbing an add cancels a pending delete of the same member
/// and vice versa.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberDiff {
    to_add: HashSet<String>,
    to_delete: HashSet<String>,
}

/// The pending-changes journal: three disjoint partitions keyed by prefixed
/// set name. This is the only input to the appliers, and its transitions are
/// what make a retried apply idempotent.
#[derive(Debug, Default)]
pub(crate) struct DirtyCache {
    to_create: HashMap<String, MemberDiff>,
    to_update: HashMap<String, MemberDiff>,
    to_destroy: HashMap<String, MemberDiff>,
}

// === impl MemberDiff ===

impl MemberDiff {
    pub fn members_to_add(&self) -> &HashSet<String> {
        &self.to_add
    }

    pub fn members_to_delete(&self) -> &HashSet<String> {
        &self.to_delete
    }

    fn absorb_add(&mut self, member: &str) {
        if !self.to_delete.remove(member) {
            self.to_add.insert(member.to_string());
        }
    }

    fn absorb_delete(&mut self, member: &str) {
        if !self.to_add.remove(member) {
            self.to_delete.insert(member.to_string());
        }
    }
}

// === impl DirtyCache ===

impl DirtyCache {
    /// Marks a set for kernel creation.
    ///
    /// A set already pending an update stays there (the kernel copy exists);
    /// a set pending destruction is resurrected into the update partition
    /// with its member diff intact.
    pub(crate) fn create(&mut self, set: &IpSet) {
        let name = set.name();
        if self.to_update.contains_key(name) {
            tracing::warn!(set = %name, "create for a set pending an update");
            return;
        }
        if let Some(diff) = self.to_destroy.remove(name) {
            tracing::debug!(set = %name, "resurrecting set pending destruction");
            self.to_update.insert(name.to_string(), diff);
            return;
        }
        // Seed with the current members: none of them has reached the kernel.
        let mut diff = MemberDiff::default();
        for member in set.kernel_member_keys() {
            diff.to_add.insert(member);
        }
        self.to_create.insert(name.to_string(), diff);
    }

    pub(crate) fn add_member(&mut self, set: &IpSet, member: &str) {
        let name = set.name();
        if let Some(diff) = self.to_create.get_mut(name) {
            diff.absorb_add(member);
            return;
        }
        if let Some(diff) = self.to_destroy.remove(name) {
            tracing::debug!(set = %name, "member add for a set pending destruction");
            self.to_update.insert(name.to_string(), diff);
        }
        self.to_update
            .entry(name.to_string())
            .or_default()
            .absorb_add(member);
    }

    pub(crate) fn delete_member(&mut self, set: &IpSet, member: &str) {
        let name = set.name();
        if self.to_destroy.contains_key(name) {
            tracing::warn!(set = %name, "member delete for a set pending destruction");
            return;
        }
        if let Some(diff) = self.to_create.get_mut(name) {
            // Never reached the kernel; retracting the pending add suffices.
            diff.to_add.remove(member);
            return;
        }
        self.to_update
            .entry(name.to_string())
            .or_default()
            .absorb_delete(member);
    }

    /// Marks a set for kernel destruction. A set still pending creation was
    /// never in the kernel and is simply forgotten. The retained diff records
    /// the current members as deletes so a later resurrection starts from an
    /// accurate picture of the kernel copy.
    pub(crate) fn destroy(&mut self, set: &IpSet) {
        let name = set.name();
        if self.to_destroy.contains_key(name) {
            return;
        }
        if self.to_create.remove(name).is_some() {
            return;
        }
        let mut diff = self.to_update.remove(name).unwrap_or_default();
        for member in set.kernel_member_keys() {
            diff.to_delete.insert(member);
        }
        diff.to_add.clear();
        self.to_destroy.insert(name.to_string(), diff);
    }

    pub(crate) fn reset(&mut self) {
        self.to_create.clear();
        self.to_update.clear();
        self.to_destroy.clear();
    }

    #[allow(dead_code)]
    pub(crate) fn reset_add_or_update(&mut self) {
        self.to_create.clear();
        self.to_update.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_destroy.is_empty()
    }

    pub(crate) fn num_to_add_or_update(&self) -> usize {
        self.to_create.len() + self.to_update.len()
    }

    pub(crate) fn num_to_destroy(&self) -> usize {
        self.to_destroy.len()
    }

    pub(crate) fn creates(&self) -> impl Iterator<Item = (&String, &MemberDiff)> {
        self.to_create.iter()
    }

    pub(crate) fn updates(&self) -> impl Iterator<Item = (&String, &MemberDiff)> {
        self.to_update.iter()
    }

    pub(crate) fn destroys(&self) -> impl Iterator<Item = &String> {
        self.to_destroy.keys()
    }

    #[cfg(test)]
    pub(crate) fn create_diff(&self, name: &str) -> Option<&MemberDiff> {
        self.to_create.get(name)
    }

    #[cfg(test)]
    pub(crate) fn update_diff(&self, name: &str) -> Option<&MemberDiff> {
        self.to_update.get(name)
    }

    #[cfg(test)]
    pub(crate) fn destroy_diff(&self, name: &str) -> Option<&MemberDiff> {
        self.to_destroy.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::IpSet;
    use npm_dataplane_core::{SetMetadata, SetType};

    fn hash_set(name: &str, members: &[(&str, &str)]) -> IpSet {
        let mut set = IpSet::new(SetMetadata::new(name, SetType::Namespace));
        for (ip, pod) in members {
            set.set_pod_key(ip, pod);
        }
        set
    }

    fn added(diff: &MemberDiff) -> Vec<&str> {
        let mut v: Vec<&str> = diff.members_to_add().iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    fn deleted(diff: &MemberDiff) -> Vec<&str> {
        let mut v: Vec<&str> = diff.members_to_delete().iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn create_seeds_current_members() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[("10.0.0.1", "x/p"), ("10.0.0.2", "x/q")]);
        dc.create(&set);
        let diff = dc.create_diff(set.name()).unwrap();
        assert_eq!(added(diff), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(diff.members_to_delete().is_empty());
    }

    #[test]
    fn create_leaves_pending_update_alone() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[]);
        dc.add_member(&set, "10.0.0.1");
        dc.create(&set);
        assert!(dc.create_diff(set.name()).is_none());
        assert_eq!(added(dc.update_diff(set.name()).unwrap()), vec!["10.0.0.1"]);
    }

    #[test]
    fn destroy_then_create_resurrects_into_update() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[("10.0.0.1", "x/p")]);
        dc.destroy(&set);
        let diff = dc.destroy_diff(set.name()).unwrap();
        assert_eq!(deleted(diff), vec!["10.0.0.1"]);

        dc.create(&set);
        assert!(dc.destroy_diff(set.name()).is_none());
        assert!(dc.create_diff(set.name()).is_none());
        let diff = dc.update_diff(set.name()).unwrap();
        assert_eq!(deleted(diff), vec!["10.0.0.1"]);
    }

    #[test]
    fn destroy_of_pending_create_is_forgotten() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[]);
        dc.create(&set);
        dc.destroy(&set);
        assert!(dc.is_empty());
    }

    #[test]
    fn adds_and_deletes_stay_disjoint() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[]);

        dc.add_member(&set, "10.0.0.1");
        dc.delete_member(&set, "10.0.0.1");
        let diff = dc.update_diff(set.name()).unwrap();
        assert!(diff.members_to_add().is_empty());
        assert!(diff.members_to_delete().is_empty());

        dc.delete_member(&set, "10.0.0.2");
        dc.add_member(&set, "10.0.0.2");
        let diff = dc.update_diff(set.name()).unwrap();
        assert!(diff.members_to_add().is_empty());
        assert!(diff.members_to_delete().is_empty());
    }

    #[test]
    fn delete_member_of_pending_create_only_retracts_the_add() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[]);
        dc.create(&set);
        dc.add_member(&set, "10.0.0.1");
        dc.delete_member(&set, "10.0.0.1");
        let diff = dc.create_diff(set.name()).unwrap();
        assert!(diff.members_to_add().is_empty());
        assert!(diff.members_to_delete().is_empty());
    }

    #[test]
    fn delete_member_after_destroy_is_ignored() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[("10.0.0.1", "x/p")]);
        dc.destroy(&set);
        dc.delete_member(&set, "10.0.0.9");
        assert_eq!(deleted(dc.destroy_diff(set.name()).unwrap()), vec!["10.0.0.1"]);
        assert_eq!(dc.num_to_add_or_update(), 0);
    }

    #[test]
    fn destroy_inherits_update_deletes_and_clears_adds() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[("10.0.0.3", "x/p")]);
        dc.add_member(&set, "10.0.0.1");
        dc.delete_member(&set, "10.0.0.2");
        dc.destroy(&set);
        let diff = dc.destroy_diff(set.name()).unwrap();
        assert!(diff.members_to_add().is_empty());
        assert_eq!(deleted(diff), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn resets() {
        let mut dc = DirtyCache::default();
        let a = hash_set("a", &[]);
        let b = hash_set("b", &[]);
        let c = hash_set("c", &[]);
        dc.create(&a);
        dc.add_member(&b, "10.0.0.1");
        dc.destroy(&c);

        dc.reset_add_or_update();
        assert_eq!(dc.num_to_add_or_update(), 0);
        assert_eq!(dc.num_to_destroy(), 1);

        dc.reset();
        assert!(dc.is_empty());
    }

    #[test]
    fn idempotent_ops() {
        let mut dc = DirtyCache::default();
        let set = hash_set("a", &[]);
        dc.add_member(&set, "10.0.0.1");
        dc.add_member(&set, "10.0.0.1");
        assert_eq!(added(dc.update_diff(set.name()).unwrap()), vec!["10.0.0.1"]);

        dc.destroy(&set);
        dc.destroy(&set);
        assert_eq!(dc.num_to_destroy(), 1);
    }
}
