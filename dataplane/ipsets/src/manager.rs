//! The transactional, OS-agnostic manager over named sets-of-IPs and
//! lists-of-sets.
//!
//! Every public operation is serialized by a single mutex; mutations update
//! the in-memory model and the dirty cache synchronously, and kernel side
//! effects are deferred until `apply_ipsets` hands the pending batch to the
//! platform applier. A successful apply plus dirty-cache clear is the atomic
//! commit point.

use crate::{
    applier::{Applier, ApplyBatch, DestroyDelta, SetDelta},
    dirty::DirtyCache,
    entity::{IpSet, ReferenceKind},
    error::IpSetError,
    metrics::Metrics,
};
use ahash::AHashMap as HashMap;
use npm_dataplane_core::{hashed_name, validate_member, SetKind, SetMetadata, TranslatedIpSet};
use parking_lot::Mutex;
use std::{collections::hash_map::Entry, str::FromStr, sync::Arc};

/// Which sets belong in the kernel: everything the manager tracks, or only
/// sets something references.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    ApplyAll,
    ApplyOnNeed,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: ApplyMode,

    /// The host-compute network the Windows applier targets. Unused on
    /// Linux.
    pub network_name: String,
}

pub struct IpSetManager<A> {
    config: Config,
    applier: A,
    metrics: Option<Arc<Metrics>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    sets: HashMap<String, IpSet>,
    dirty: DirtyCache,
}

/// Whether a set belongs in the kernel right now.
fn in_kernel(mode: ApplyMode, set: &IpSet) -> bool {
    mode == ApplyMode::ApplyAll || set.has_references() || set.kernel_ref_count() > 0
}

// === impl ApplyMode ===

impl ApplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplyAll => "apply-all",
            Self::ApplyOnNeed => "apply-on-need",
        }
    }
}

impl FromStr for ApplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply-all" | "all" => Ok(Self::ApplyAll),
            "apply-on-need" | "on-need" => Ok(Self::ApplyOnNeed),
            s => Err(format!("invalid apply mode: {s}")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ApplyMode::ApplyOnNeed,
            network_name: "azure".to_string(),
        }
    }
}

// === impl IpSetManager ===

impl<A> IpSetManager<A> {
    pub fn new(config: Config, applier: A) -> Self {
        Self {
            config,
            applier,
            metrics: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A snapshot of the named set, if tracked.
    pub fn get_ipset(&self, prefixed_name: &str) -> Option<IpSet> {
        self.state.lock().sets.get(prefixed_name).cloned()
    }

    pub fn num_sets(&self) -> usize {
        self.state.lock().sets.len()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().dirty.is_empty()
    }

    /// `(sets to add or update, sets to destroy)` currently pending.
    pub fn pending_counts(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.dirty.num_to_add_or_update(), st.dirty.num_to_destroy())
    }

    /// Creates any missing sets. In apply-all mode, new sets are marked for
    /// kernel creation immediately.
    pub fn create_ipsets(&self, metadatas: &[SetMetadata]) {
        let mut st = self.state.lock();
        for md in metadatas {
            st.ensure(self.config.mode, md);
        }
        self.observe(&st);
    }

    /// Drops the named set if nothing holds on to it; otherwise this is
    /// deliberately a silent no-op, since the set may still be needed.
    pub fn delete_ipset(&self, prefixed_name: &str) {
        let mut st = self.state.lock();
        st.delete_ipset(self.config.mode, prefixed_name);
        self.observe(&st);
    }

    /// Records a policy's claim on a set. When the set crosses into kernel
    /// scope it is marked for creation, and for lists the members' kernel
    /// reference counts follow.
    pub fn add_reference(
        &self,
        prefixed_name: &str,
        reference: &str,
        kind: ReferenceKind,
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.add_reference(self.config.mode, prefixed_name, reference, kind);
        self.observe(&st);
        res
    }

    pub fn delete_reference(
        &self,
        prefixed_name: &str,
        reference: &str,
        kind: ReferenceKind,
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.delete_reference(self.config.mode, prefixed_name, reference, kind);
        self.observe(&st);
        res
    }

    /// Binds `member` to `pod_key` in each target set, creating missing
    /// sets. The most recent observation wins: an existing binding is
    /// replaced without error.
    pub fn add_to_sets(
        &self,
        metadatas: &[SetMetadata],
        member: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.add_to_sets(self.config.mode, metadatas, member, pod_key);
        self.observe(&st);
        res
    }

    /// Removes `member` from each target set where `pod_key` still owns it.
    /// A mismatched owner means the delete is stale and is ignored.
    pub fn remove_from_sets(
        &self,
        metadatas: &[SetMetadata],
        member: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.remove_from_sets(self.config.mode, metadatas, member, pod_key);
        self.observe(&st);
        res
    }

    /// Links each member set into each list, creating missing sets. Lists
    /// of lists are rejected.
    pub fn add_to_lists(
        &self,
        list_metadatas: &[SetMetadata],
        member_metadatas: &[SetMetadata],
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.add_to_lists(self.config.mode, list_metadatas, member_metadatas);
        self.observe(&st);
        res
    }

    pub fn remove_from_list(
        &self,
        list_metadata: &SetMetadata,
        member_metadatas: &[SetMetadata],
    ) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let res = st.remove_from_list(self.config.mode, list_metadata, member_metadatas);
        self.observe(&st);
        res
    }

    /// Ingests translator output: creates the sets and adds their literal
    /// members — IPs/CIDRs as unowned hash entries, prefixed set names as
    /// list links.
    pub fn add_translated_sets(&self, translated: &[TranslatedIpSet]) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        let mode = self.config.mode;
        for t in translated {
            match t.metadata.kind() {
                SetKind::Hash => {
                    st.ensure(mode, &t.metadata);
                    let target = std::slice::from_ref(&t.metadata);
                    for member in &t.members {
                        st.add_to_sets(mode, target, member, "")?;
                    }
                }
                SetKind::List => {
                    let member_mds = t
                        .members
                        .iter()
                        .map(|m| {
                            SetMetadata::from_prefixed_name(m)
                                .ok_or_else(|| IpSetError::UnknownMemberName(m.clone()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    st.add_to_lists(mode, std::slice::from_ref(&t.metadata), &member_mds)?;
                }
            }
        }
        self.observe(&st);
        Ok(())
    }

    /// The intersection of IPs across the named selector-eligible sets,
    /// mapped to their owning pod keys.
    pub fn get_ips_from_selector_ipsets(
        &self,
        set_names: &[String],
    ) -> Result<HashMap<String, String>, IpSetError> {
        self.state.lock().selector_ips(set_names)
    }

    fn observe(&self, st: &State) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(
                st.sets.len(),
                st.dirty.num_to_add_or_update() + st.dirty.num_to_destroy(),
            );
        }
    }
}

impl<A: Applier> IpSetManager<A> {
    /// Flushes the dirty cache to the kernel through the platform applier.
    /// On success the cache is cleared; on failure it is retained so a later
    /// call retries from scratch.
    pub fn apply_ipsets(&self) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        if st.dirty.is_empty() {
            tracing::debug!("no pending ipset changes");
            return Ok(());
        }

        let batch = st.build_batch();
        tracing::info!(
            to_add_or_update = batch.to_add_or_update.len(),
            to_destroy = batch.to_destroy.len(),
            "applying ipsets"
        );

        match self.applier.apply(&batch) {
            Ok(()) => {
                st.dirty.reset();
                if let Some(metrics) = &self.metrics {
                    metrics.inc_applies();
                }
                self.observe(&st);
                Ok(())
            }
            Err(error) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_apply_failures();
                }
                tracing::warn!(%error, "apply failed; pending changes retained");
                Err(error.into())
            }
        }
    }

    /// Drops the whole in-memory model and asks the applier to clear all
    /// agent-owned kernel state. The model is cleared first so a failed
    /// kernel reset can be retried from a clean logical slate.
    pub fn reset_ipsets(&self) -> Result<(), IpSetError> {
        let mut st = self.state.lock();
        tracing::info!("resetting all agent-owned kernel state");
        st.sets.clear();
        st.dirty.reset();
        self.observe(&st);
        self.applier.reset()?;
        Ok(())
    }
}

// === impl State ===

impl State {
    fn get_or_create<'a>(
        sets: &'a mut HashMap<String, IpSet>,
        dirty: &mut DirtyCache,
        mode: ApplyMode,
        md: &SetMetadata,
    ) -> &'a mut IpSet {
        match sets.entry(md.prefixed_name()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let set = IpSet::new(md.clone());
                tracing::debug!(set = %set.name(), "tracking new set");
                if mode == ApplyMode::ApplyAll {
                    dirty.create(&set);
                }
                entry.insert(set)
            }
        }
    }

    fn ensure(&mut self, mode: ApplyMode, md: &SetMetadata) {
        let Self { sets, dirty } = self;
        Self::get_or_create(sets, dirty, mode, md);
    }

    fn delete_ipset(&mut self, mode: ApplyMode, name: &str) {
        let Self { sets, dirty } = self;
        let Some(set) = sets.get(name) else {
            return;
        };
        if !set.is_deletable() {
            tracing::debug!(set = %name, "set still in use; skipping delete");
            return;
        }
        let destroy = in_kernel(mode, set);
        if let Some(set) = sets.remove(name) {
            if destroy {
                dirty.destroy(&set);
            }
        }
    }

    fn add_reference(
        &mut self,
        mode: ApplyMode,
        name: &str,
        reference: &str,
        kind: ReferenceKind,
    ) -> Result<(), IpSetError> {
        let Self { sets, dirty } = self;
        let members = {
            let set = sets
                .get_mut(name)
                .ok_or_else(|| IpSetError::SetDoesNotExist(name.to_string()))?;
            if kind == ReferenceKind::Selector && !set.set_type().is_selector_eligible() {
                return Err(IpSetError::NotSelectorEligible {
                    name: name.to_string(),
                    set_type: set.set_type(),
                });
            }
            let was_in_kernel = in_kernel(mode, set);
            set.add_reference(kind, reference);
            if was_in_kernel {
                return Ok(());
            }
            dirty.create(set);
            set.list_member_names()
        };

        for member_name in members {
            if let Some(member) = sets.get_mut(&member_name) {
                let was_in_kernel = in_kernel(mode, member);
                member.inc_kernel_ref();
                if !was_in_kernel {
                    dirty.create(member);
                }
            } else {
                tracing::warn!(list = %name, member = %member_name, "list member missing from cache");
            }
        }
        Ok(())
    }

    fn delete_reference(
        &mut self,
        mode: ApplyMode,
        name: &str,
        reference: &str,
        kind: ReferenceKind,
    ) -> Result<(), IpSetError> {
        let Self { sets, dirty } = self;
        let members = {
            let set = sets
                .get_mut(name)
                .ok_or_else(|| IpSetError::SetDoesNotExist(name.to_string()))?;
            let was_in_kernel = in_kernel(mode, set);
            set.delete_reference(kind, reference);
            if !was_in_kernel || in_kernel(mode, set) {
                return Ok(());
            }
            // Left kernel scope: tear down the kernel copy. The entity stays
            // tracked until nothing refers to it at all.
            dirty.destroy(set);
            set.list_member_names()
        };

        for member_name in members {
            if let Some(member) = sets.get_mut(&member_name) {
                let was_in_kernel = in_kernel(mode, member);
                member.dec_kernel_ref();
                if was_in_kernel && !in_kernel(mode, member) {
                    dirty.destroy(member);
                }
            }
        }
        Ok(())
    }

    fn add_to_sets(
        &mut self,
        mode: ApplyMode,
        metadatas: &[SetMetadata],
        member: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        for md in metadatas {
            let name = md.prefixed_name();
            if md.kind() != SetKind::Hash {
                return Err(IpSetError::KindMismatch {
                    name,
                    expected: SetKind::Hash,
                    actual: SetKind::List,
                });
            }
            validate_member(md.set_type(), member).map_err(|source| IpSetError::InvalidMember {
                name: name.clone(),
                source,
            })?;
            if let Some(set) = self.sets.get(&name) {
                if set.kind() != SetKind::Hash {
                    return Err(IpSetError::KindMismatch {
                        name,
                        expected: SetKind::Hash,
                        actual: set.kind(),
                    });
                }
            }
        }

        let Self { sets, dirty } = self;
        for md in metadatas {
            let set = Self::get_or_create(sets, dirty, mode, md);
            if let Some(previous) = set.set_pod_key(member, pod_key) {
                if previous != pod_key {
                    tracing::debug!(
                        set = %set.name(),
                        %member,
                        %previous,
                        owner = %pod_key,
                        "replacing member owner"
                    );
                }
            }
            if in_kernel(mode, set) {
                dirty.add_member(set, member);
            }
        }
        Ok(())
    }

    fn remove_from_sets(
        &mut self,
        mode: ApplyMode,
        metadatas: &[SetMetadata],
        member: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        for md in metadatas {
            let name = md.prefixed_name();
            if md.kind() != SetKind::Hash {
                return Err(IpSetError::KindMismatch {
                    name,
                    expected: SetKind::Hash,
                    actual: SetKind::List,
                });
            }
            if let Some(set) = self.sets.get(&name) {
                if set.kind() != SetKind::Hash {
                    return Err(IpSetError::KindMismatch {
                        name,
                        expected: SetKind::Hash,
                        actual: set.kind(),
                    });
                }
            }
        }

        let Self { sets, dirty } = self;
        for md in metadatas {
            let Some(set) = sets.get_mut(&md.prefixed_name()) else {
                continue;
            };
            match set.pod_key_of(member) {
                None => continue,
                Some(owner) if owner != pod_key => {
                    tracing::debug!(
                        set = %set.name(),
                        %member,
                        %owner,
                        claimant = %pod_key,
                        "ignoring stale member delete"
                    );
                    continue;
                }
                Some(_) => {}
            }
            set.remove_ip(member);
            if in_kernel(mode, set) {
                dirty.delete_member(set, member);
            }
        }
        Ok(())
    }

    fn add_to_lists(
        &mut self,
        mode: ApplyMode,
        list_metadatas: &[SetMetadata],
        member_metadatas: &[SetMetadata],
    ) -> Result<(), IpSetError> {
        for md in list_metadatas {
            let name = md.prefixed_name();
            if md.kind() != SetKind::List {
                return Err(IpSetError::KindMismatch {
                    name,
                    expected: SetKind::List,
                    actual: SetKind::Hash,
                });
            }
            if let Some(set) = self.sets.get(&name) {
                if set.kind() != SetKind::List {
                    return Err(IpSetError::KindMismatch {
                        name,
                        expected: SetKind::List,
                        actual: set.kind(),
                    });
                }
            }
        }
        for md in member_metadatas {
            let name = md.prefixed_name();
            if md.kind() != SetKind::Hash {
                return Err(IpSetError::NestedList(name));
            }
            if let Some(set) = self.sets.get(&name) {
                if set.kind() != SetKind::Hash {
                    return Err(IpSetError::NestedList(name));
                }
            }
        }

        let Self { sets, dirty } = self;
        for list_md in list_metadatas {
            let list_name = list_md.prefixed_name();
            Self::get_or_create(sets, dirty, mode, list_md);

            for member_md in member_metadatas {
                let member_name = member_md.prefixed_name();
                Self::get_or_create(sets, dirty, mode, member_md);

                let linked = match sets.get_mut(&list_name) {
                    Some(list) => list.insert_member(&member_name),
                    None => false,
                };
                if !linked {
                    continue;
                }
                if let Some(member) = sets.get_mut(&member_name) {
                    member.inc_ipset_ref();
                }

                let list_in_kernel = sets
                    .get(&list_name)
                    .map(|list| in_kernel(mode, list))
                    .unwrap_or(false);
                if !list_in_kernel {
                    continue;
                }
                if let Some(list) = sets.get(&list_name) {
                    dirty.add_member(list, &hashed_name(&member_name));
                }
                if let Some(member) = sets.get_mut(&member_name) {
                    let was_in_kernel = in_kernel(mode, member);
                    member.inc_kernel_ref();
                    if !was_in_kernel {
                        dirty.create(member);
                    }
                }
            }
        }
        Ok(())
    }

    fn remove_from_list(
        &mut self,
        mode: ApplyMode,
        list_metadata: &SetMetadata,
        member_metadatas: &[SetMetadata],
    ) -> Result<(), IpSetError> {
        let list_name = list_metadata.prefixed_name();
        if list_metadata.kind() != SetKind::List {
            return Err(IpSetError::KindMismatch {
                name: list_name,
                expected: SetKind::List,
                actual: SetKind::Hash,
            });
        }
        match self.sets.get(&list_name) {
            None => return Err(IpSetError::SetDoesNotExist(list_name)),
            Some(set) if set.kind() != SetKind::List => {
                return Err(IpSetError::KindMismatch {
                    name: list_name,
                    expected: SetKind::List,
                    actual: set.kind(),
                })
            }
            Some(_) => {}
        }
        for md in member_metadatas {
            if md.kind() != SetKind::Hash {
                return Err(IpSetError::NestedList(md.prefixed_name()));
            }
        }

        let Self { sets, dirty } = self;
        let list_in_kernel = sets
            .get(&list_name)
            .map(|list| in_kernel(mode, list))
            .unwrap_or(false);

        for member_md in member_metadatas {
            let member_name = member_md.prefixed_name();
            let unlinked = match sets.get_mut(&list_name) {
                Some(list) => list.remove_member(&member_name),
                None => false,
            };
            if !unlinked {
                continue;
            }
            if list_in_kernel {
                if let Some(list) = sets.get(&list_name) {
                    dirty.delete_member(list, &hashed_name(&member_name));
                }
            }
            if let Some(member) = sets.get_mut(&member_name) {
                member.dec_ipset_ref();
                if list_in_kernel {
                    let was_in_kernel = in_kernel(mode, member);
                    member.dec_kernel_ref();
                    if was_in_kernel && !in_kernel(mode, member) {
                        dirty.destroy(member);
                    }
                }
            }
        }
        Ok(())
    }

    fn selector_ips(&self, set_names: &[String]) -> Result<HashMap<String, String>, IpSetError> {
        let mut selected = Vec::with_capacity(set_names.len());
        for name in set_names {
            let set = self
                .sets
                .get(name)
                .ok_or_else(|| IpSetError::SetDoesNotExist(name.clone()))?;
            if !set.set_type().is_selector_eligible() {
                return Err(IpSetError::NotSelectorEligible {
                    name: name.clone(),
                    set_type: set.set_type(),
                });
            }
            selected.push(set);
        }
        let Some((base, rest)) = selected.split_first() else {
            return Ok(HashMap::default());
        };

        // Scan from the first set: a hash base is its own member map, a list
        // base is the union of its members' maps.
        let mut result: HashMap<String, String> = match base.ip_pod_keys() {
            Some(members) => members.clone(),
            None => {
                let mut union = HashMap::default();
                for member_name in base.list_members().into_iter().flatten() {
                    if let Some(member) = self.sets.get(member_name) {
                        if let Some(ip_pod_keys) = member.ip_pod_keys() {
                            for (ip, pod_key) in ip_pod_keys {
                                union
                                    .entry(ip.clone())
                                    .or_insert_with(|| pod_key.clone());
                            }
                        }
                    }
                }
                union
            }
        };

        for set in rest {
            result.retain(|ip, _| self.contains_ip(set, ip));
        }
        Ok(result)
    }

    fn contains_ip(&self, set: &IpSet, ip: &str) -> bool {
        match set.list_members() {
            None => set.contains_member(ip),
            Some(members) => members.iter().any(|member_name| {
                self.sets
                    .get(member_name)
                    .map(|member| member.contains_member(ip))
                    .unwrap_or(false)
            }),
        }
    }

    fn build_batch(&self) -> ApplyBatch {
        let mut to_add_or_update = Vec::with_capacity(self.dirty.num_to_add_or_update());
        let creates = self.dirty.creates().map(|(name, diff)| (name, diff, true));
        let updates = self.dirty.updates().map(|(name, diff)| (name, diff, false));
        for (name, diff, create) in creates.chain(updates) {
            let Some(set) = self.sets.get(name) else {
                tracing::warn!(set = %name, "dirty set missing from cache; skipping");
                continue;
            };
            let mut members_to_add: Vec<String> =
                diff.members_to_add().iter().cloned().collect();
            members_to_add.sort_unstable();
            let mut members_to_delete: Vec<String> =
                diff.members_to_delete().iter().cloned().collect();
            members_to_delete.sort_unstable();
            let mut desired_members = set.kernel_member_keys();
            desired_members.sort_unstable();

            to_add_or_update.push(SetDelta {
                name: name.clone(),
                hashed_name: set.hashed_name().to_string(),
                set_type: set.set_type(),
                kind: set.kind(),
                create,
                members_to_add,
                members_to_delete,
                desired_members,
            });
        }
        to_add_or_update.sort_by(|a, b| a.name.cmp(&b.name));

        let mut to_destroy: Vec<DestroyDelta> = self
            .dirty
            .destroys()
            .map(|name| DestroyDelta {
                name: name.clone(),
                hashed_name: hashed_name(name),
            })
            .collect();
        to_destroy.sort_by(|a, b| a.name.cmp(&b.name));

        ApplyBatch {
            to_add_or_update,
            to_destroy,
        }
    }
}
