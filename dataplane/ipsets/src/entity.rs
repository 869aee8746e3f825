use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use npm_dataplane_core::{hashed_name, SetKind, SetMetadata, SetType};

/// Why a policy object claims a set: as its pod selector, or as a rule peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Selector,
    NetPol,
}

/// The in-memory record of one set.
///
/// Hash sets map each member to the pod key that last claimed it; list sets
/// hold the prefixed names of their member sets. The manager owns every
/// entity through its set map and maintains the two reference counters:
/// `ipset_ref_count` counts lists containing this set, `kernel_ref_count`
/// counts the subset of those lists that are in the kernel.
#[derive(Clone, Debug)]
pub struct IpSet {
    metadata: SetMetadata,
    name: String,
    hashed_name: String,
    contents: Contents,
    selector_refs: HashSet<String>,
    netpol_refs: HashSet<String>,
    ipset_ref_count: usize,
    kernel_ref_count: usize,
}

#[derive(Clone, Debug)]
enum Contents {
    Hash(HashMap<String, String>),
    List(HashSet<String>),
}

// === impl IpSet ===

impl IpSet {
    pub(crate) fn new(metadata: SetMetadata) -> Self {
        let name = metadata.prefixed_name();
        let hashed_name = hashed_name(&name);
        let contents = match metadata.kind() {
            SetKind::Hash => Contents::Hash(HashMap::default()),
            SetKind::List => Contents::List(HashSet::default()),
        };
        Self {
            metadata,
            name,
            hashed_name,
            contents,
            selector_refs: HashSet::default(),
            netpol_refs: HashSet::default(),
            ipset_ref_count: 0,
            kernel_ref_count: 0,
        }
    }

    /// The prefixed name, i.e. the manager's cache key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kernel-visible identifier.
    pub fn hashed_name(&self) -> &str {
        &self.hashed_name
    }

    pub fn metadata(&self) -> &SetMetadata {
        &self.metadata
    }

    pub fn set_type(&self) -> SetType {
        self.metadata.set_type()
    }

    pub fn kind(&self) -> SetKind {
        self.metadata.kind()
    }

    pub fn has_references(&self) -> bool {
        !self.selector_refs.is_empty() || !self.netpol_refs.is_empty()
    }

    pub fn ipset_ref_count(&self) -> usize {
        self.ipset_ref_count
    }

    pub fn kernel_ref_count(&self) -> usize {
        self.kernel_ref_count
    }

    pub fn num_members(&self) -> usize {
        match &self.contents {
            Contents::Hash(members) => members.len(),
            Contents::List(members) => members.len(),
        }
    }

    /// A set may be dropped from the model only once nothing at all holds on
    /// to it: no policy references, no containing lists, no members.
    pub fn is_deletable(&self) -> bool {
        !self.has_references() && self.ipset_ref_count == 0 && self.num_members() == 0
    }

    /// The pod key that owns `member`, if any. Hash sets only.
    pub fn pod_key_of(&self, member: &str) -> Option<&str> {
        match &self.contents {
            Contents::Hash(members) => members.get(member).map(String::as_str),
            Contents::List(_) => None,
        }
    }

    /// The member-to-pod-key map of a hash set.
    pub fn ip_pod_keys(&self) -> Option<&HashMap<String, String>> {
        match &self.contents {
            Contents::Hash(members) => Some(members),
            Contents::List(_) => None,
        }
    }

    /// The prefixed names of a list's member sets.
    pub fn list_members(&self) -> Option<&HashSet<String>> {
        match &self.contents {
            Contents::Hash(_) => None,
            Contents::List(members) => Some(members),
        }
    }

    pub(crate) fn list_member_names(&self) -> Vec<String> {
        match &self.contents {
            Contents::Hash(_) => Vec::new(),
            Contents::List(members) => members.iter().cloned().collect(),
        }
    }

    /// Whether `member` (an IP for hash sets, a prefixed name for lists) is
    /// present.
    pub fn contains_member(&self, member: &str) -> bool {
        match &self.contents {
            Contents::Hash(members) => members.contains_key(member),
            Contents::List(members) => members.contains(member),
        }
    }

    /// The members as the kernel spells them: literal member strings for a
    /// hash set, member hashed names for a list.
    pub fn kernel_member_keys(&self) -> Vec<String> {
        match &self.contents {
            Contents::Hash(members) => members.keys().cloned().collect(),
            Contents::List(members) => members.iter().map(|m| hashed_name(m)).collect(),
        }
    }

    pub(crate) fn add_reference(&mut self, kind: ReferenceKind, reference: &str) {
        let refs = match kind {
            ReferenceKind::Selector => &mut self.selector_refs,
            ReferenceKind::NetPol => &mut self.netpol_refs,
        };
        refs.insert(reference.to_string());
    }

    pub(crate) fn delete_reference(&mut self, kind: ReferenceKind, reference: &str) {
        let refs = match kind {
            ReferenceKind::Selector => &mut self.selector_refs,
            ReferenceKind::NetPol => &mut self.netpol_refs,
        };
        refs.remove(reference);
    }

    /// Binds `member` to `pod_key`, returning the previous owner. The most
    /// recent observation always wins.
    pub(crate) fn set_pod_key(&mut self, member: &str, pod_key: &str) -> Option<String> {
        match &mut self.contents {
            Contents::Hash(members) => members.insert(member.to_string(), pod_key.to_string()),
            Contents::List(_) => None,
        }
    }

    pub(crate) fn remove_ip(&mut self, member: &str) {
        if let Contents::Hash(members) = &mut self.contents {
            members.remove(member);
        }
    }

    /// Links a member set into this list. Returns false when already linked.
    pub(crate) fn insert_member(&mut self, member_name: &str) -> bool {
        match &mut self.contents {
            Contents::Hash(_) => false,
            Contents::List(members) => members.insert(member_name.to_string()),
        }
    }

    /// Unlinks a member set. Returns false when it was not a member.
    pub(crate) fn remove_member(&mut self, member_name: &str) -> bool {
        match &mut self.contents {
            Contents::Hash(_) => false,
            Contents::List(members) => members.remove(member_name),
        }
    }

    pub(crate) fn inc_ipset_ref(&mut self) {
        self.ipset_ref_count += 1;
    }

    pub(crate) fn dec_ipset_ref(&mut self) {
        self.ipset_ref_count = self.ipset_ref_count.saturating_sub(1);
    }

    pub(crate) fn inc_kernel_ref(&mut self) {
        self.kernel_ref_count += 1;
    }

    pub(crate) fn dec_kernel_ref(&mut self) {
        self.kernel_ref_count = self.kernel_ref_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletable_only_when_fully_released() {
        let mut set = IpSet::new(SetMetadata::new("a", SetType::Namespace));
        assert!(set.is_deletable());

        set.set_pod_key("10.0.0.1", "ns/pod");
        assert!(!set.is_deletable());
        set.remove_ip("10.0.0.1");
        assert!(set.is_deletable());

        set.add_reference(ReferenceKind::NetPol, "ns/pol");
        assert!(!set.is_deletable());
        set.delete_reference(ReferenceKind::NetPol, "ns/pol");
        assert!(set.is_deletable());

        set.inc_ipset_ref();
        assert!(!set.is_deletable());
        set.dec_ipset_ref();
        assert!(set.is_deletable());
    }

    #[test]
    fn kernel_member_keys_hash_lists() {
        let mut ns = IpSet::new(SetMetadata::new("a", SetType::Namespace));
        ns.set_pod_key("10.0.0.1", "ns/pod");
        assert_eq!(ns.kernel_member_keys(), vec!["10.0.0.1".to_string()]);

        let mut list = IpSet::new(SetMetadata::new("app", SetType::NestedLabelOfPod));
        list.insert_member("podlabel-app:web");
        assert_eq!(
            list.kernel_member_keys(),
            vec![hashed_name("podlabel-app:web")]
        );
    }
}
