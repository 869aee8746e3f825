//! Renders pending set changes into host-compute set-policy batches.
//!
//! Adds install first-level sets before the nested policies that reference
//! them; removes run in the reverse order. Every nested member is validated
//! against the about-to-be-applied network state before anything is sent.

use crate::{
    hns::{
        self, HnsError, HostNetworkService, ModifyNetworkSettingsRequest, NetworkPolicy,
        PolicyNetworkRequest, RequestType, SetPolicySetting, SetPolicyType,
    },
    timeout::TimedHns,
};
use ahash::AHashSet as HashSet;
use npm_dataplane_core::{SetKind, KERNEL_SET_PREFIX};
use npm_dataplane_ipsets::{Applier, ApplyBatch, ApplyError, ErrorKind, SetDelta};
use std::time::Duration;

pub struct HnsApplier<S> {
    hns: TimedHns<S>,
    network_name: String,
}

fn map_hns_err(err: HnsError) -> ApplyError {
    match err {
        HnsError::Timeout => {
            ApplyError::with_source(ErrorKind::Timeout, "host network service call", err)
        }
        err => ApplyError::with_source(ErrorKind::Transient, "host network service call", err),
    }
}

fn set_policy(delta: &SetDelta) -> Result<NetworkPolicy, ApplyError> {
    let setting = SetPolicySetting {
        id: delta.hashed_name.clone(),
        name: delta.name.clone(),
        policy_type: if delta.kind == SetKind::List {
            SetPolicyType::NestedIpSet
        } else {
            SetPolicyType::IpSet
        },
        values: delta.desired_members.join(","),
    };
    NetworkPolicy::set_policy(&setting)
        .map_err(|err| ApplyError::with_source(ErrorKind::Fatal, "encoding set policy", err))
}

// === impl HnsApplier ===

impl<S: HostNetworkService + 'static> HnsApplier<S> {
    pub fn new(hns: S, network_name: impl Into<String>) -> Self {
        Self {
            hns: TimedHns::new(hns),
            network_name: network_name.into(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.hns = self.hns.with_timeout(timeout);
        self
    }

    fn modify(
        &self,
        network_id: &str,
        request_type: RequestType,
        policies: Vec<NetworkPolicy>,
    ) -> Result<(), ApplyError> {
        if policies.is_empty() {
            return Ok(());
        }
        tracing::debug!(?request_type, policies = policies.len(), "modifying network settings");
        let request =
            ModifyNetworkSettingsRequest::policy(request_type, &PolicyNetworkRequest { policies })
                .map_err(|err| {
                    ApplyError::with_source(ErrorKind::Fatal, "encoding policy request", err)
                })?;
        self.hns
            .modify_network_settings(network_id, &request)
            .map_err(map_hns_err)
    }
}

impl<S: HostNetworkService + 'static> Applier for HnsApplier<S> {
    fn apply(&self, batch: &ApplyBatch) -> Result<(), ApplyError> {
        if batch.is_empty() {
            return Ok(());
        }
        let network = self
            .hns
            .get_network_by_name(&self.network_name)
            .map_err(map_hns_err)?;

        // The ids that will exist once this batch lands: what the network
        // holds now, minus the removes, plus the first-level sets we install.
        let deleting: HashSet<&str> = batch
            .to_destroy
            .iter()
            .map(|d| d.hashed_name.as_str())
            .collect();
        let mut available: HashSet<String> = network
            .policies
            .iter()
            .filter_map(hns::as_set_policy)
            .map(|sp| sp.id)
            .filter(|id| !deleting.contains(id.as_str()))
            .collect();
        for delta in &batch.to_add_or_update {
            if delta.kind == SetKind::Hash {
                available.insert(delta.hashed_name.clone());
            }
        }
        for delta in &batch.to_add_or_update {
            if delta.kind != SetKind::List {
                continue;
            }
            for member in &delta.desired_members {
                if !available.contains(member.as_str()) {
                    return Err(ApplyError::new(
                        ErrorKind::Validation,
                        format!(
                            "nested set {} references unknown member {member}",
                            delta.name
                        ),
                    ));
                }
            }
        }

        // Removes first, nested before first-level, so member sets are
        // unreferenced by the time they go.
        let nested_destroys: Vec<NetworkPolicy> = batch
            .to_destroy
            .iter()
            .filter(|d| d.kind() == SetKind::List)
            .map(|d| destroy_policy(d.hashed_name.clone(), d.name.clone(), SetPolicyType::NestedIpSet))
            .collect::<Result<_, _>>()?;
        let first_destroys: Vec<NetworkPolicy> = batch
            .to_destroy
            .iter()
            .filter(|d| d.kind() == SetKind::Hash)
            .map(|d| destroy_policy(d.hashed_name.clone(), d.name.clone(), SetPolicyType::IpSet))
            .collect::<Result<_, _>>()?;
        self.modify(&network.id, RequestType::Remove, nested_destroys)?;
        self.modify(&network.id, RequestType::Remove, first_destroys)?;

        // Adds and updates: first-level sets, then the nested policies that
        // reference them.
        let phases = [
            (RequestType::Add, SetKind::Hash, true),
            (RequestType::Update, SetKind::Hash, false),
            (RequestType::Add, SetKind::List, true),
            (RequestType::Update, SetKind::List, false),
        ];
        for (request_type, kind, create) in phases {
            let policies: Vec<NetworkPolicy> = batch
                .to_add_or_update
                .iter()
                .filter(|d| d.kind == kind && d.create == create)
                .map(set_policy)
                .collect::<Result<_, _>>()?;
            self.modify(&network.id, request_type, policies)?;
        }
        Ok(())
    }

    /// Removes every agent-owned set policy from the network in one request,
    /// keeping everything else. A missing network is already clean.
    fn reset(&self) -> Result<(), ApplyError> {
        let network = match self.hns.get_network_by_name(&self.network_name) {
            Ok(network) => network,
            Err(HnsError::NetworkNotFound(name)) => {
                tracing::debug!(network = %name, "network absent; nothing to reset");
                return Ok(());
            }
            Err(err) => return Err(map_hns_err(err)),
        };

        let mut ours: Vec<(SetPolicySetting, NetworkPolicy)> = network
            .policies
            .iter()
            .filter_map(|p| hns::as_set_policy(p).map(|sp| (sp, p.clone())))
            .filter(|(sp, _)| sp.id.starts_with(KERNEL_SET_PREFIX))
            .collect();
        if ours.is_empty() {
            return Ok(());
        }
        // Nested policies first, mirroring the delete ordering.
        ours.sort_by_key(|(sp, _)| sp.policy_type == SetPolicyType::IpSet);
        let policies = ours.into_iter().map(|(_, p)| p).collect();
        self.modify(&network.id, RequestType::Remove, policies)
    }
}

fn destroy_policy(
    id: String,
    name: String,
    policy_type: SetPolicyType,
) -> Result<NetworkPolicy, ApplyError> {
    let setting = SetPolicySetting {
        id,
        name,
        policy_type,
        values: String::new(),
    };
    NetworkPolicy::set_policy(&setting)
        .map_err(|err| ApplyError::with_source(ErrorKind::Fatal, "encoding set policy", err))
}
