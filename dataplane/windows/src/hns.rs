//! Wire forms for the host-compute network service, and the injected shim
//! the applier calls through. The JSON shapes mirror the service's
//! PascalCase schema.

use serde::{Deserialize, Serialize};

/// The policy type tag carried on set policies attached to a network.
pub const SET_POLICY: &str = "SetPolicy";

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SetPolicyType {
    #[serde(rename = "IPSET")]
    IpSet,
    #[serde(rename = "NESTEDIPSET")]
    NestedIpSet,
}

/// One set as the service stores it: the hashed name as the durable id, the
/// prefixed name for operators, and the members as a comma-joined string.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SetPolicySetting {
    pub id: String,
    pub name: String,
    pub policy_type: SetPolicyType,
    pub values: String,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkPolicy {
    #[serde(rename = "Type")]
    pub policy_type: String,
    pub settings: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyNetworkRequest {
    pub policies: Vec<NetworkPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyNetworkSettingsRequest {
    pub resource_type: String,
    pub request_type: RequestType,
    pub settings: serde_json::Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HostComputeNetwork {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub policies: Vec<NetworkPolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum HnsError {
    /// The per-call deadline fired; the orphaned call may still complete.
    #[error("timed out waiting for the host network service")]
    Timeout,

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("host network service call failed: {0}")]
    Call(String),
}

/// The injected host-compute service shim. Production wires the real
/// service client; tests wire a recording fake.
pub trait HostNetworkService: Send + Sync {
    fn get_network_by_name(&self, name: &str) -> Result<HostComputeNetwork, HnsError>;

    fn modify_network_settings(
        &self,
        network_id: &str,
        request: &ModifyNetworkSettingsRequest,
    ) -> Result<(), HnsError>;
}

/// Decodes a network policy as a set policy, if it is one.
pub fn as_set_policy(policy: &NetworkPolicy) -> Option<SetPolicySetting> {
    if policy.policy_type != SET_POLICY {
        return None;
    }
    serde_json::from_value(policy.settings.clone()).ok()
}

// === impl NetworkPolicy ===

impl NetworkPolicy {
    pub fn set_policy(setting: &SetPolicySetting) -> Result<Self, serde_json::Error> {
        Ok(Self {
            policy_type: SET_POLICY.to_string(),
            settings: serde_json::to_value(setting)?,
        })
    }
}

// === impl ModifyNetworkSettingsRequest ===

impl ModifyNetworkSettingsRequest {
    pub fn policy(
        request_type: RequestType,
        request: &PolicyNetworkRequest,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            resource_type: "Policy".to_string(),
            request_type,
            settings: serde_json::to_value(request)?,
        })
    }

    /// The set policies carried by this request, for observers.
    pub fn set_policies(&self) -> Vec<SetPolicySetting> {
        serde_json::from_value::<PolicyNetworkRequest>(self.settings.clone())
            .map(|r| r.policies.iter().filter_map(as_set_policy).collect())
            .unwrap_or_default()
    }
}
